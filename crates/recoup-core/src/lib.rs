//! Core domain model for seller reimbursement anomaly detection.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "recoup-core";

/// Tables a seller dataset is read from; recorded in every evidence document.
pub const SOURCE_TABLES: [&str; 6] = [
    "sellers",
    "inventory_records",
    "fee_line_items",
    "damage_records",
    "shipment_records",
    "refund_records",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// `retrying` re-enters the poll pool exactly like `pending`.
    pub fn is_pollable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError::new("job status", s))
    }
}

/// Unit of work pulled off the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionJob {
    pub id: Uuid,
    pub seller_id: String,
    pub sync_id: String,
    pub status: JobStatus,
    pub priority: i32,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DetectionJob {
    pub fn is_eligible(&self) -> bool {
        self.status.is_pollable() && self.attempt_count < self.max_attempts
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Enqueue request from the job-producing collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub seller_id: String,
    pub sync_id: String,
    pub priority: i32,
    pub max_attempts: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    OverchargedFees,
    LostInventory,
    DamagedInventory,
    ShipmentDiscrepancy,
    RefundWithoutReturn,
}

impl RuleType {
    pub const ALL: [RuleType; 5] = [
        RuleType::OverchargedFees,
        RuleType::LostInventory,
        RuleType::DamagedInventory,
        RuleType::ShipmentDiscrepancy,
        RuleType::RefundWithoutReturn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::OverchargedFees => "OVERCHARGED_FEES",
            RuleType::LostInventory => "LOST_INVENTORY",
            RuleType::DamagedInventory => "DAMAGED_INVENTORY",
            RuleType::ShipmentDiscrepancy => "SHIPMENT_DISCREPANCY",
            RuleType::RefundWithoutReturn => "REFUND_WITHOUT_RETURN",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuleType::ALL
            .into_iter()
            .find(|rule| rule.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError::new("rule type", s))
    }
}

/// Comparison applied as `value <op> threshold`.
///
/// `Equal` and `NotEqual` are exact IEEE-754 comparisons with no tolerance. They
/// are only meaningful for values that are copied verbatim from source records,
/// not for derived amounts such as deltas or products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThresholdOperator {
    #[serde(rename = ">", alias = "GREATER_THAN")]
    GreaterThan,
    #[serde(rename = ">=", alias = "GREATER_THAN_OR_EQUAL")]
    GreaterThanOrEqual,
    #[serde(rename = "<", alias = "LESS_THAN")]
    LessThan,
    #[serde(rename = "<=", alias = "LESS_THAN_OR_EQUAL")]
    LessThanOrEqual,
    #[serde(rename = "==", alias = "EQUAL")]
    Equal,
    #[serde(rename = "!=", alias = "NOT_EQUAL")]
    NotEqual,
}

impl ThresholdOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            ThresholdOperator::GreaterThan => ">",
            ThresholdOperator::GreaterThanOrEqual => ">=",
            ThresholdOperator::LessThan => "<",
            ThresholdOperator::LessThanOrEqual => "<=",
            ThresholdOperator::Equal => "==",
            ThresholdOperator::NotEqual => "!=",
        }
    }

    #[allow(clippy::float_cmp)]
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            ThresholdOperator::GreaterThan => value > threshold,
            ThresholdOperator::GreaterThanOrEqual => value >= threshold,
            ThresholdOperator::LessThan => value < threshold,
            ThresholdOperator::LessThanOrEqual => value <= threshold,
            ThresholdOperator::Equal => value == threshold,
            ThresholdOperator::NotEqual => value != threshold,
        }
    }
}

impl fmt::Display for ThresholdOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for ThresholdOperator {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            ">" | "GREATER_THAN" => Ok(ThresholdOperator::GreaterThan),
            ">=" | "GREATER_THAN_OR_EQUAL" => Ok(ThresholdOperator::GreaterThanOrEqual),
            "<" | "LESS_THAN" => Ok(ThresholdOperator::LessThan),
            "<=" | "LESS_THAN_OR_EQUAL" => Ok(ThresholdOperator::LessThanOrEqual),
            "==" | "=" | "EQUAL" => Ok(ThresholdOperator::Equal),
            "!=" | "<>" | "NOT_EQUAL" => Ok(ThresholdOperator::NotEqual),
            _ => Err(ParseEnumError::new("threshold operator", s)),
        }
    }
}

/// Named numeric rule parameter. `seller_id = None` means global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub id: Uuid,
    pub rule_type: RuleType,
    pub operator: ThresholdOperator,
    pub value: f64,
    pub seller_id: Option<String>,
    pub active: bool,
}

impl Threshold {
    pub fn global(rule_type: RuleType, operator: ThresholdOperator, value: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_type,
            operator,
            value,
            seller_id: None,
            active: true,
        }
    }

    pub fn for_seller(
        seller_id: impl Into<String>,
        rule_type: RuleType,
        operator: ThresholdOperator,
        value: f64,
    ) -> Self {
        Self {
            seller_id: Some(seller_id.into()),
            ..Self::global(rule_type, operator, value)
        }
    }

    pub fn triggers(&self, value: f64) -> bool {
        self.active && self.operator.holds(value, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhitelistScope {
    Sku,
    Vendor,
    Account,
    Shipment,
    Asin,
}

impl WhitelistScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            WhitelistScope::Sku => "sku",
            WhitelistScope::Vendor => "vendor",
            WhitelistScope::Account => "account",
            WhitelistScope::Shipment => "shipment",
            WhitelistScope::Asin => "asin",
        }
    }
}

impl fmt::Display for WhitelistScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WhitelistScope {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sku" => Ok(WhitelistScope::Sku),
            "vendor" => Ok(WhitelistScope::Vendor),
            "account" => Ok(WhitelistScope::Account),
            "shipment" => Ok(WhitelistScope::Shipment),
            "asin" => Ok(WhitelistScope::Asin),
            _ => Err(ParseEnumError::new("whitelist scope", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistItem {
    pub id: Uuid,
    pub scope: WhitelistScope,
    pub value: String,
    pub reason: Option<String>,
    pub active: bool,
    pub seller_id: Option<String>,
}

impl WhitelistItem {
    pub fn new(scope: WhitelistScope, value: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            value: value.into(),
            reason: None,
            active: true,
            seller_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(ParseEnumError::new("severity", s)),
        }
    }
}

/// Identifiers a whitelist entry can match against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScopedIdentifiers {
    pub sku: Option<String>,
    pub asin: Option<String>,
    pub vendor: Option<String>,
    pub shipment_id: Option<String>,
    pub account_id: Option<String>,
}

impl ScopedIdentifiers {
    pub fn get(&self, scope: WhitelistScope) -> Option<&str> {
        match scope {
            WhitelistScope::Sku => self.sku.as_deref(),
            WhitelistScope::Asin => self.asin.as_deref(),
            WhitelistScope::Vendor => self.vendor.as_deref(),
            WhitelistScope::Shipment => self.shipment_id.as_deref(),
            WhitelistScope::Account => self.account_id.as_deref(),
        }
    }
}

/// In-memory finding produced by a rule, not yet deduplicated or persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAnomaly {
    pub rule_type: RuleType,
    pub severity: Severity,
    pub confidence: f64,
    pub summary: String,
    pub item_id: String,
    pub amount_discrepancy: f64,
    pub identifiers: ScopedIdentifiers,
    /// Source rows backing the finding, as `table:row_key`.
    pub source_refs: Vec<String>,
    pub evidence: JsonValue,
    pub dedup_hash: String,
}

/// Durable record of a non-duplicate, non-whitelisted candidate.
/// `(seller_id, rule_type, dedup_hash)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub id: Uuid,
    pub seller_id: String,
    pub rule_type: RuleType,
    pub severity: Severity,
    pub confidence: f64,
    pub summary: String,
    pub evidence_ref: String,
    pub dedup_hash: String,
    pub job_id: Uuid,
    pub whitelisted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDetectionResult {
    pub seller_id: String,
    pub rule_type: RuleType,
    pub severity: Severity,
    pub confidence: f64,
    pub summary: String,
    pub evidence_ref: String,
    pub dedup_hash: String,
    pub job_id: Uuid,
}

impl NewDetectionResult {
    pub fn from_candidate(
        job: &DetectionJob,
        candidate: &CandidateAnomaly,
        evidence_ref: &str,
    ) -> Self {
        Self {
            seller_id: job.seller_id.clone(),
            rule_type: candidate.rule_type,
            severity: candidate.severity,
            confidence: candidate.confidence,
            summary: candidate.summary.clone(),
            evidence_ref: evidence_ref.to_string(),
            dedup_hash: candidate.dedup_hash.clone(),
            job_id: job.id,
        }
    }
}

/// Normalized per-seller input for one sync window.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SellerDataset {
    pub seller_id: String,
    pub sync_id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub inventory: Vec<InventoryRecord>,
    #[serde(default)]
    pub fees: Vec<FeeLineItem>,
    #[serde(default)]
    pub damages: Vec<DamageRecord>,
    #[serde(default)]
    pub shipments: Vec<ShipmentRecord>,
    #[serde(default)]
    pub refunds: Vec<RefundRecord>,
}

impl SellerDataset {
    pub fn record_count(&self) -> usize {
        self.inventory.len()
            + self.fees.len()
            + self.damages.len()
            + self.shipments.len()
            + self.refunds.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub sku: String,
    #[serde(default)]
    pub asin: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    pub expected_quantity: i64,
    pub counted_quantity: i64,
    pub unit_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeLineItem {
    pub line_id: String,
    pub sku: String,
    #[serde(default)]
    pub asin: Option<String>,
    pub fee_type: String,
    pub amount: f64,
    #[serde(alias = "expectedFee")]
    pub expected_fee: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageRecord {
    pub damage_id: String,
    pub sku: String,
    #[serde(default)]
    pub asin: Option<String>,
    pub quantity: i64,
    pub unit_value: f64,
    #[serde(default)]
    pub reimbursed_amount: f64,
    #[serde(default)]
    pub reason_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentRecord {
    pub shipment_id: String,
    pub sku: String,
    #[serde(default)]
    pub asin: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    pub units_shipped: i64,
    pub units_received: i64,
    pub unit_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub order_id: String,
    pub sku: String,
    #[serde(default)]
    pub asin: Option<String>,
    pub refund_amount: f64,
    pub returned: bool,
    pub refunded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateDisposition {
    New,
    Whitelisted,
    Duplicate,
}

/// Externally stored evidence backing one job's findings. Never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceDocument {
    pub sync_id: String,
    pub job_id: Uuid,
    pub seller_id: String,
    pub anomalies: Vec<EvidenceEntry>,
    pub metadata: EvidenceMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub event_type: RuleType,
    pub item_id: String,
    pub amount_discrepancy: f64,
    pub evidence_refs: Vec<String>,
    pub severity: Severity,
    pub confidence: f64,
    pub summary: String,
    pub dedup_hash: String,
    pub disposition: CandidateDisposition,
    pub identifiers: ScopedIdentifiers,
    pub details: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    pub source_tables: Vec<String>,
    pub detection_version: String,
    pub attempt: i32,
    pub generated_at: DateTime<Utc>,
    pub thresholds_applied: Vec<Threshold>,
    pub whitelist_applied: Vec<WhitelistItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greater_than_threshold_matches_boundaries() {
        let threshold =
            Threshold::global(RuleType::OverchargedFees, ThresholdOperator::GreaterThan, 10.0);
        assert!(threshold.triggers(11.0));
        assert!(!threshold.triggers(10.0));
        assert!(!threshold.triggers(9.0));
    }

    #[test]
    fn every_operator_respects_its_boundary() {
        use ThresholdOperator::*;
        let cases = [
            (GreaterThanOrEqual, [false, true, true]),
            (LessThan, [true, false, false]),
            (LessThanOrEqual, [true, true, false]),
            (Equal, [false, true, false]),
            (NotEqual, [true, false, true]),
        ];
        for (operator, expected) in cases {
            let got = [9.999, 10.0, 10.001].map(|value| operator.holds(value, 10.0));
            assert_eq!(got, expected, "{operator}");
        }
    }

    #[test]
    fn equality_operators_compare_exactly() {
        assert!(!ThresholdOperator::Equal.holds(0.1 + 0.2, 0.3));
        assert!(ThresholdOperator::NotEqual.holds(0.1 + 0.2, 0.3));
        assert!(ThresholdOperator::Equal.holds(-0.0, 0.0));
    }

    #[test]
    fn inactive_threshold_never_triggers() {
        let mut threshold = Threshold::global(
            RuleType::LostInventory,
            ThresholdOperator::GreaterThanOrEqual,
            1.0,
        );
        threshold.active = false;
        assert!(!threshold.triggers(100.0));
    }

    #[test]
    fn operators_parse_from_symbols_and_names() {
        let parse = |raw: &str| raw.parse::<ThresholdOperator>().unwrap();
        assert_eq!(parse("GREATER_THAN"), ThresholdOperator::GreaterThan);
        assert_eq!(parse(">="), ThresholdOperator::GreaterThanOrEqual);
        assert_eq!(parse("!="), ThresholdOperator::NotEqual);
        assert!("~".parse::<ThresholdOperator>().is_err());

        let op: ThresholdOperator = serde_json::from_str("\"<=\"").unwrap();
        assert_eq!(op, ThresholdOperator::LessThanOrEqual);
        assert_eq!(serde_json::to_string(&ThresholdOperator::Equal).unwrap(), "\"==\"");
    }

    #[test]
    fn retrying_jobs_stay_eligible_until_attempts_run_out() {
        let mut job = DetectionJob {
            id: Uuid::new_v4(),
            seller_id: "S1".into(),
            sync_id: "sync-1".into(),
            status: JobStatus::Retrying,
            priority: 0,
            attempt_count: 1,
            max_attempts: 3,
            failure_reason: Some("boom".into()),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert!(job.is_eligible());
        job.attempt_count = 3;
        assert!(!job.is_eligible());
        assert!(job.attempts_exhausted());
        job.attempt_count = 1;
        job.status = JobStatus::Completed;
        assert!(!job.is_eligible());
        assert!(job.status.is_terminal());
    }

    #[test]
    fn whitelist_scope_parse_is_case_insensitive() {
        assert_eq!("SKU".parse::<WhitelistScope>().unwrap(), WhitelistScope::Sku);
        assert_eq!(" Shipment ".parse::<WhitelistScope>().unwrap(), WhitelistScope::Shipment);
        assert!("warehouse".parse::<WhitelistScope>().is_err());
    }

    #[test]
    fn rule_type_round_trips_through_text() {
        for rule in RuleType::ALL {
            assert_eq!(rule.as_str().parse::<RuleType>().unwrap(), rule);
            let json = serde_json::to_string(&rule).unwrap();
            assert_eq!(json, format!("\"{}\"", rule.as_str()));
        }
    }

    #[test]
    fn fee_line_item_accepts_camel_case_expected_fee() {
        let item: FeeLineItem = serde_json::from_str(
            r#"{"line_id":"L1","sku":"SKU-1","fee_type":"fulfillment",
                "amount":15.0,"expectedFee":12.0}"#,
        )
        .unwrap();
        assert_eq!(item.expected_fee, 12.0);
        assert_eq!(item.asin, None);
    }
}
