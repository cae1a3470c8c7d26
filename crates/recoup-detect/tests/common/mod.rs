#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use recoup_core::{
    FeeLineItem, JobStatus, NewJob, RuleType, SellerDataset, Threshold, ThresholdOperator,
};
use recoup_detect::{ControllerConfig, DetectionPipeline, JobController};
use recoup_rules::{RuleCatalog, RuleEngine};
use recoup_storage::{BlobStore, JobStore, MemoryBlobStore, MemoryDetectionStore, StoredBlob};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

pub fn fee_dataset(
    seller_id: &str,
    sync_id: &str,
    amount: f64,
    expected_fee: f64,
) -> SellerDataset {
    SellerDataset {
        seller_id: seller_id.to_string(),
        sync_id: sync_id.to_string(),
        account_id: Some(format!("ACC-{seller_id}")),
        fees: vec![FeeLineItem {
            line_id: format!("{seller_id}-L1"),
            sku: "SKU-1".to_string(),
            asin: Some("B000TEST01".to_string()),
            fee_type: "fulfillment".to_string(),
            amount,
            expected_fee,
        }],
        ..Default::default()
    }
}

pub fn new_job(seller_id: &str, priority: i32, max_attempts: i32) -> NewJob {
    NewJob {
        seller_id: seller_id.to_string(),
        sync_id: "sync-1".to_string(),
        priority,
        max_attempts,
    }
}

/// Store seeded with the global `OVERCHARGED_FEES > 2.0` threshold.
pub async fn seeded_store() -> Arc<MemoryDetectionStore> {
    let store = Arc::new(MemoryDetectionStore::new());
    store
        .insert_threshold(Threshold::global(
            RuleType::OverchargedFees,
            ThresholdOperator::GreaterThan,
            2.0,
        ))
        .await;
    store
}

pub fn pipeline(
    store: Arc<MemoryDetectionStore>,
    blobs: Arc<dyn BlobStore>,
) -> Arc<DetectionPipeline> {
    let engine = RuleEngine::new(RuleCatalog::default());
    Arc::new(DetectionPipeline::new(store, blobs, engine))
}

pub fn fast_config(concurrency: usize) -> ControllerConfig {
    ControllerConfig {
        poll_interval: Duration::from_millis(10),
        concurrency,
        batch_size: 10,
        job_timeout: Duration::from_secs(5),
        reclaim_margin: Duration::from_secs(5),
        drain_poll_interval: Duration::from_millis(5),
    }
}

pub fn controller(
    store: Arc<MemoryDetectionStore>,
    blobs: Arc<dyn BlobStore>,
    config: ControllerConfig,
) -> Arc<JobController> {
    let pipeline = pipeline(store.clone(), blobs);
    Arc::new(JobController::new(store, pipeline, config))
}

pub async fn wait_for_status(store: &MemoryDetectionStore, job_id: uuid::Uuid, status: JobStatus) {
    for _ in 0..500 {
        if let Ok(Some(job)) = store.get_job(job_id).await {
            if job.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {status}");
}

pub struct FailingBlobStore;

#[async_trait]
impl BlobStore for FailingBlobStore {
    async fn put_json(&self, key: &str, _document: &JsonValue) -> anyhow::Result<StoredBlob> {
        bail!("blob store rejected {key}")
    }

    async fn get_json(&self, _key: &str) -> anyhow::Result<Option<JsonValue>> {
        Ok(None)
    }
}

/// Takes the store down while the first write is in flight, then rejects that write.
pub struct OutageBlobStore {
    pub inner: MemoryBlobStore,
    pub store: Arc<MemoryDetectionStore>,
    pub tripped: AtomicBool,
}

impl OutageBlobStore {
    pub fn new(store: Arc<MemoryDetectionStore>) -> Self {
        Self {
            inner: MemoryBlobStore::new(),
            store,
            tripped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BlobStore for OutageBlobStore {
    async fn put_json(&self, key: &str, document: &JsonValue) -> anyhow::Result<StoredBlob> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            self.store.set_unavailable(true);
            bail!("disk went away while writing {key}");
        }
        self.inner.put_json(key, document).await
    }

    async fn get_json(&self, key: &str) -> anyhow::Result<Option<JsonValue>> {
        self.inner.get_json(key).await
    }
}

struct WritingGuard<'a>(&'a AtomicUsize);

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Delays every write and records how many jobs were `processing` at that moment.
/// `writing` counts writes still in progress, including ones whose task was aborted.
pub struct ObservingBlobStore {
    pub inner: MemoryBlobStore,
    pub store: Arc<MemoryDetectionStore>,
    pub delay: Duration,
    pub max_processing: AtomicUsize,
    pub writing: AtomicUsize,
    pub write_order: Mutex<Vec<String>>,
}

impl ObservingBlobStore {
    pub fn new(store: Arc<MemoryDetectionStore>, delay: Duration) -> Self {
        Self {
            inner: MemoryBlobStore::new(),
            store,
            delay,
            max_processing: AtomicUsize::new(0),
            writing: AtomicUsize::new(0),
            write_order: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BlobStore for ObservingBlobStore {
    async fn put_json(&self, key: &str, document: &JsonValue) -> anyhow::Result<StoredBlob> {
        self.writing.fetch_add(1, Ordering::SeqCst);
        let _writing = WritingGuard(&self.writing);
        tokio::time::sleep(self.delay).await;
        let processing = self.store.count_in_status(JobStatus::Processing).await;
        self.max_processing.fetch_max(processing, Ordering::SeqCst);
        let seller = document["seller_id"].as_str().unwrap_or_default().to_string();
        self.write_order.lock().await.push(seller);
        self.inner.put_json(key, document).await
    }

    async fn get_json(&self, key: &str) -> anyhow::Result<Option<JsonValue>> {
        self.inner.get_json(key).await
    }
}
