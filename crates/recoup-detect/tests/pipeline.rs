mod common;

use std::sync::Arc;

use common::{fee_dataset, new_job, pipeline, seeded_store};
use recoup_core::{
    CandidateDisposition, EvidenceDocument, JobStatus, RuleType, Severity, WhitelistItem,
    WhitelistScope,
};
use recoup_detect::{evidence_key, JobError};
use recoup_storage::{BlobStore, FsBlobStore, JobStore, MemoryBlobStore, ResultStore};

#[tokio::test]
async fn overcharged_fee_produces_one_medium_result_with_evidence() {
    let store = seeded_store().await;
    store.insert_dataset(fee_dataset("S", "sync-1", 15.0, 12.0)).await;
    let blobs = Arc::new(MemoryBlobStore::new());
    let pipeline = pipeline(store.clone(), blobs.clone());

    let job = store.enqueue_job(new_job("S", 0, 3)).await.unwrap();
    let claimed = store.claim_job(job.id).await.unwrap().unwrap();
    let outcome = pipeline.execute(&claimed).await.unwrap();
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.duplicates, 0);

    let results = store.results_for_job(job.id).await.unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.rule_type, RuleType::OverchargedFees);
    assert_eq!(result.severity, Severity::Medium);
    assert_eq!(result.confidence, 0.5);
    assert!(!result.whitelisted);
    assert_eq!(result.evidence_ref, evidence_key("S", job.id, 1));

    let stored = blobs.get_json(&result.evidence_ref).await.unwrap().expect("evidence written");
    let document: EvidenceDocument = serde_json::from_value(stored).unwrap();
    assert_eq!(document.job_id, job.id);
    assert_eq!(document.sync_id, "sync-1");
    assert_eq!(document.anomalies.len(), 1);
    assert_eq!(document.anomalies[0].event_type, RuleType::OverchargedFees);
    assert_eq!(document.anomalies[0].item_id, "S-L1");
    assert_eq!(document.anomalies[0].amount_discrepancy, 3.0);
    assert_eq!(document.anomalies[0].evidence_refs, vec!["fee_line_items:S-L1".to_string()]);
    assert_eq!(document.metadata.attempt, 1);
    assert!(document.metadata.source_tables.contains(&"fee_line_items".to_string()));
    assert_eq!(document.metadata.thresholds_applied.len(), 1);

    assert_eq!(store.get_job(job.id).await.unwrap().unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn reprocessing_the_same_data_never_duplicates_results() {
    let store = seeded_store().await;
    store.insert_dataset(fee_dataset("S", "sync-1", 15.0, 12.0)).await;
    let blobs = Arc::new(MemoryBlobStore::new());
    let pipeline = pipeline(store.clone(), blobs.clone());

    let first = store.enqueue_job(new_job("S", 0, 3)).await.unwrap();
    let second = store.enqueue_job(new_job("S", 0, 3)).await.unwrap();
    for job in [&first, &second] {
        let claimed = store.claim_job(job.id).await.unwrap().unwrap();
        pipeline.execute(&claimed).await.unwrap();
    }

    let results = store.all_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].job_id, first.id);
    assert_eq!(store.get_job(second.id).await.unwrap().unwrap().status, JobStatus::Completed);

    // the second job still records its finding for audit, marked as a duplicate
    let stored = blobs
        .get_json(&evidence_key("S", second.id, 1))
        .await
        .unwrap()
        .expect("evidence for second job");
    let document: EvidenceDocument = serde_json::from_value(stored).unwrap();
    assert_eq!(document.anomalies[0].disposition, CandidateDisposition::Duplicate);
}

#[tokio::test]
async fn whitelisted_sku_is_never_persisted() {
    let store = seeded_store().await;
    store.insert_dataset(fee_dataset("S", "sync-1", 5000.0, 12.0)).await;
    store.insert_whitelist_item(WhitelistItem::new(WhitelistScope::Sku, "SKU-1")).await;
    let blobs = Arc::new(MemoryBlobStore::new());
    let pipeline = pipeline(store.clone(), blobs.clone());

    let job = store.enqueue_job(new_job("S", 0, 3)).await.unwrap();
    let claimed = store.claim_job(job.id).await.unwrap().unwrap();
    let outcome = pipeline.execute(&claimed).await.unwrap();
    assert_eq!(outcome.whitelisted, 1);
    assert_eq!(outcome.inserted, 0);
    assert!(store.all_results().await.is_empty());

    let stored = blobs.get_json(&evidence_key("S", job.id, 1)).await.unwrap().unwrap();
    let document: EvidenceDocument = serde_json::from_value(stored).unwrap();
    assert_eq!(document.anomalies[0].disposition, CandidateDisposition::Whitelisted);
    assert_eq!(document.metadata.whitelist_applied.len(), 1);
}

#[tokio::test]
async fn clean_dataset_still_leaves_an_empty_evidence_document() {
    let store = seeded_store().await;
    store.insert_dataset(fee_dataset("S", "sync-1", 12.5, 12.0)).await;
    let blobs = Arc::new(MemoryBlobStore::new());
    let pipeline = pipeline(store.clone(), blobs.clone());

    let job = store.enqueue_job(new_job("S", 0, 3)).await.unwrap();
    let claimed = store.claim_job(job.id).await.unwrap().unwrap();
    let outcome = pipeline.execute(&claimed).await.unwrap();
    assert_eq!(outcome.candidates, 0);
    assert_eq!(outcome.evidence_ref, evidence_key("S", job.id, 1));
    assert_eq!(blobs.keys().await, vec![outcome.evidence_ref.clone()]);

    let stored = blobs.get_json(&outcome.evidence_ref).await.unwrap().unwrap();
    let document: EvidenceDocument = serde_json::from_value(stored).unwrap();
    assert!(document.anomalies.is_empty());
    assert_eq!(document.metadata.thresholds_applied.len(), 1);
    assert!(store.all_results().await.is_empty());
    assert_eq!(store.get_job(job.id).await.unwrap().unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn repeated_finding_within_one_job_is_persisted_once() {
    let store = seeded_store().await;
    let mut dataset = fee_dataset("S", "sync-1", 15.0, 12.0);
    dataset.fees.push(dataset.fees[0].clone());
    store.insert_dataset(dataset).await;
    let blobs = Arc::new(MemoryBlobStore::new());
    let pipeline = pipeline(store.clone(), blobs.clone());

    let job = store.enqueue_job(new_job("S", 0, 3)).await.unwrap();
    let claimed = store.claim_job(job.id).await.unwrap().unwrap();
    let outcome = pipeline.execute(&claimed).await.unwrap();
    assert_eq!(outcome.candidates, 2);
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.duplicates, 1);
    assert_eq!(store.all_results().await.len(), 1);

    let stored = blobs.get_json(&outcome.evidence_ref).await.unwrap().unwrap();
    let document: EvidenceDocument = serde_json::from_value(stored).unwrap();
    let dispositions = document.anomalies.iter().map(|a| a.disposition).collect::<Vec<_>>();
    assert_eq!(
        dispositions,
        vec![CandidateDisposition::New, CandidateDisposition::Duplicate]
    );
}

#[tokio::test]
async fn unknown_seller_is_a_data_error() {
    let store = seeded_store().await;
    let pipeline = pipeline(store.clone(), Arc::new(MemoryBlobStore::new()));

    let job = store.enqueue_job(new_job("ghost", 0, 3)).await.unwrap();
    let claimed = store.claim_job(job.id).await.unwrap().unwrap();
    let err = pipeline.execute(&claimed).await.unwrap_err();
    assert!(matches!(err, JobError::SellerNotFound { .. }));
    assert_eq!(store.get_job(job.id).await.unwrap().unwrap().status, JobStatus::Processing);
}

#[tokio::test]
async fn evidence_lands_on_disk_under_seller_and_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store().await;
    store.insert_dataset(fee_dataset("S", "sync-1", 15.0, 12.0)).await;
    let pipeline = pipeline(store.clone(), Arc::new(FsBlobStore::new(dir.path())));

    let job = store.enqueue_job(new_job("S", 0, 3)).await.unwrap();
    let claimed = store.claim_job(job.id).await.unwrap().unwrap();
    let outcome = pipeline.execute(&claimed).await.unwrap();

    let path = dir.path().join(&outcome.evidence_ref);
    assert!(path.exists(), "missing {}", path.display());
    let bytes = std::fs::read(path).unwrap();
    let document: EvidenceDocument = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(document.seller_id, "S");
}
