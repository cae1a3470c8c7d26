//! Anomaly rules, threshold resolution, whitelist matching and scoring.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use recoup_core::{
    CandidateAnomaly, RuleType, ScopedIdentifiers, SellerDataset, Severity, Threshold,
    ThresholdOperator, WhitelistItem,
};
use recoup_storage::sha256_hex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recoup-rules";

/// Stamped into every evidence document; bump when rule semantics change.
pub const DETECTION_LOGIC_VERSION: &str = "recoup-rules/1.0.0";

/// A refund is only suspicious once the return window has closed.
pub const REFUND_RETURN_WINDOW_DAYS: i64 = 45;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("{rule_type}: record {record} has {problem} {field}")]
    InvalidRecord {
        rule_type: RuleType,
        record: String,
        field: &'static str,
        problem: &'static str,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub ratio: f64,
    pub severity: Severity,
    pub confidence: f64,
}

pub fn severity_for_ratio(ratio: f64) -> Severity {
    if ratio >= 5.0 {
        Severity::Critical
    } else if ratio >= 3.0 {
        Severity::High
    } else if ratio >= 1.5 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

pub fn confidence_for_ratio(ratio: f64) -> f64 {
    f64::min(0.95, f64::max(0.5, ratio / 10.0))
}

/// `ratio = |actual| / |threshold|`. A zero threshold yields an infinite ratio for
/// any non-zero value.
pub fn score(actual: f64, threshold: f64) -> Score {
    let denominator = threshold.abs();
    let ratio = if denominator == 0.0 {
        if actual == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        actual.abs() / denominator
    };
    Score {
        ratio,
        severity: severity_for_ratio(ratio),
        confidence: confidence_for_ratio(ratio),
    }
}

/// Rule-specific identifying fields. `BTreeMap` keeps the keys sorted.
pub type CoreFields = BTreeMap<&'static str, String>;

pub fn dedup_key(seller_id: &str, rule_type: RuleType, core_fields: &CoreFields) -> String {
    let mut key = format!("{seller_id}|{}", rule_type.as_str());
    for (name, value) in core_fields {
        key.push('|');
        key.push_str(name);
        key.push(':');
        key.push_str(value);
    }
    key
}

pub fn dedup_hash(seller_id: &str, rule_type: RuleType, core_fields: &CoreFields) -> String {
    sha256_hex(dedup_key(seller_id, rule_type, core_fields).as_bytes())
}

/// Thresholds resolved per rule type for one seller.
///
/// Seller-scoped store thresholds win over global ones for the same rule type;
/// catalog defaults apply only when the store has neither.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdSet {
    by_rule: BTreeMap<RuleType, Vec<Threshold>>,
}

impl ThresholdSet {
    pub fn resolve(seller_id: &str, stored: &[Threshold], catalog: &RuleCatalog) -> Self {
        let mut by_rule = BTreeMap::new();
        for rule_type in RuleType::ALL {
            let active = stored
                .iter()
                .filter(|t| t.active && t.rule_type == rule_type)
                .collect::<Vec<_>>();
            let seller_scoped = active
                .iter()
                .filter(|t| t.seller_id.as_deref() == Some(seller_id))
                .map(|t| (*t).clone())
                .collect::<Vec<_>>();
            let resolved = if !seller_scoped.is_empty() {
                seller_scoped
            } else {
                let global = active
                    .iter()
                    .filter(|t| t.seller_id.is_none())
                    .map(|t| (*t).clone())
                    .collect::<Vec<_>>();
                if global.is_empty() {
                    catalog.default_thresholds(rule_type)
                } else {
                    global
                }
            };
            if !resolved.is_empty() {
                by_rule.insert(rule_type, resolved);
            }
        }
        Self { by_rule }
    }

    pub fn for_rule(&self, rule_type: RuleType) -> &[Threshold] {
        self.by_rule.get(&rule_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The most severe triggering threshold: largest ratio, then lowest id.
    /// Independent of the order the store returned the rows in.
    pub fn triggering(&self, rule_type: RuleType, value: f64) -> Option<&Threshold> {
        self.for_rule(rule_type)
            .iter()
            .filter(|t| t.triggers(value))
            .max_by(|a, b| {
                score(value, a.value)
                    .ratio
                    .total_cmp(&score(value, b.value).ratio)
                    .then_with(|| b.id.cmp(&a.id))
            })
    }

    pub fn all(&self) -> Vec<Threshold> {
        self.by_rule.values().flatten().cloned().collect()
    }
}

/// Scope is matched through the enum, values are compared exactly.
pub fn matching_whitelist_entry<'a>(
    identifiers: &ScopedIdentifiers,
    whitelist: &'a [WhitelistItem],
) -> Option<&'a WhitelistItem> {
    whitelist
        .iter()
        .filter(|item| item.active)
        .find(|item| identifiers.get(item.scope) == Some(item.value.as_str()))
}

pub fn is_whitelisted(candidate: &CandidateAnomaly, whitelist: &[WhitelistItem]) -> bool {
    matching_whitelist_entry(&candidate.identifiers, whitelist).is_some()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCatalog {
    #[serde(default = "default_catalog_version")]
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<RuleCatalogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCatalogEntry {
    pub rule_type: RuleType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub default_thresholds: Vec<CatalogThreshold>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CatalogThreshold {
    pub operator: ThresholdOperator,
    pub value: f64,
}

fn default_catalog_version() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl RuleCatalog {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing rule catalog")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Missing file means every rule enabled, no defaults.
    pub fn load_optional(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no rule catalog, using built-in defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    fn entry(&self, rule_type: RuleType) -> Option<&RuleCatalogEntry> {
        self.rules.iter().find(|entry| entry.rule_type == rule_type)
    }

    pub fn is_enabled(&self, rule_type: RuleType) -> bool {
        self.entry(rule_type).map_or(true, |entry| entry.enabled)
    }

    pub fn default_thresholds(&self, rule_type: RuleType) -> Vec<Threshold> {
        let Some(entry) = self.entry(rule_type) else {
            return Vec::new();
        };
        entry
            .default_thresholds
            .iter()
            .map(|t| Threshold {
                id: Uuid::new_v5(
                    &Uuid::NAMESPACE_OID,
                    format!("catalog:{}:{}:{}", rule_type, t.operator, t.value).as_bytes(),
                ),
                ..Threshold::global(rule_type, t.operator, t.value)
            })
            .collect()
    }
}

/// Everything a rule may consult besides the dataset itself.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub seller_id: String,
    pub account_id: Option<String>,
    pub thresholds: ThresholdSet,
    pub whitelist: Vec<WhitelistItem>,
    pub evaluated_at: DateTime<Utc>,
}

pub trait Rule: Send + Sync {
    fn rule_type(&self) -> RuleType;
    fn apply(
        &self,
        dataset: &SellerDataset,
        ctx: &RuleContext,
    ) -> Result<Vec<CandidateAnomaly>, RuleError>;
}

fn ensure_finite(
    rule_type: RuleType,
    record: &str,
    field: &'static str,
    value: f64,
) -> Result<f64, RuleError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RuleError::InvalidRecord {
            rule_type,
            record: record.to_string(),
            field,
            problem: "non-finite",
        })
    }
}

fn unit_shortfall(
    rule_type: RuleType,
    record: &str,
    field: &'static str,
    expected: i64,
    actual: i64,
) -> Result<i64, RuleError> {
    expected.checked_sub(actual).ok_or_else(|| RuleError::InvalidRecord {
        rule_type,
        record: record.to_string(),
        field,
        problem: "overflowing",
    })
}

fn money(value: f64) -> String {
    format!("{value}")
}

struct Finding {
    rule_type: RuleType,
    item_id: String,
    compared_value: f64,
    amount_discrepancy: f64,
    summary: String,
    identifiers: ScopedIdentifiers,
    source_ref: String,
    details: JsonValue,
    core_fields: CoreFields,
}

fn candidate(ctx: &RuleContext, threshold: &Threshold, finding: Finding) -> CandidateAnomaly {
    let score = score(finding.compared_value, threshold.value);
    let mut identifiers = finding.identifiers;
    if identifiers.account_id.is_none() {
        identifiers.account_id = ctx.account_id.clone();
    }
    let mut evidence = finding.details;
    if let JsonValue::Object(map) = &mut evidence {
        map.insert(
            "threshold".to_string(),
            json!({
                "id": threshold.id,
                "operator": threshold.operator,
                "value": threshold.value,
                "seller_scoped": threshold.seller_id.is_some(),
            }),
        );
        map.insert("ratio".to_string(), json!(score.ratio));
    }
    CandidateAnomaly {
        rule_type: finding.rule_type,
        severity: score.severity,
        confidence: score.confidence,
        summary: finding.summary,
        item_id: finding.item_id,
        amount_discrepancy: finding.amount_discrepancy,
        identifiers,
        source_refs: vec![finding.source_ref],
        evidence,
        dedup_hash: dedup_hash(&ctx.seller_id, finding.rule_type, &finding.core_fields),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OverchargedFeesRule;

impl Rule for OverchargedFeesRule {
    fn rule_type(&self) -> RuleType {
        RuleType::OverchargedFees
    }

    fn apply(
        &self,
        dataset: &SellerDataset,
        ctx: &RuleContext,
    ) -> Result<Vec<CandidateAnomaly>, RuleError> {
        let rule_type = self.rule_type();
        let mut out = Vec::new();
        for fee in &dataset.fees {
            let amount = ensure_finite(rule_type, &fee.line_id, "amount", fee.amount)?;
            let expected =
                ensure_finite(rule_type, &fee.line_id, "expected_fee", fee.expected_fee)?;
            let delta = amount - expected;
            let Some(threshold) = ctx.thresholds.triggering(rule_type, delta) else {
                continue;
            };
            let core_fields = CoreFields::from([
                ("amount", money(amount)),
                ("expected_fee", money(expected)),
                ("fee_type", fee.fee_type.clone()),
                ("line_id", fee.line_id.clone()),
                ("sku", fee.sku.clone()),
            ]);
            out.push(candidate(
                ctx,
                threshold,
                Finding {
                    rule_type,
                    item_id: fee.line_id.clone(),
                    compared_value: delta,
                    amount_discrepancy: delta,
                    summary: format!(
                        "{} fee on {} charged {:.2}, expected {:.2} (over by {:.2})",
                        fee.fee_type, fee.sku, amount, expected, delta
                    ),
                    identifiers: ScopedIdentifiers {
                        sku: Some(fee.sku.clone()),
                        asin: fee.asin.clone(),
                        ..Default::default()
                    },
                    source_ref: format!("fee_line_items:{}", fee.line_id),
                    details: json!({
                        "line_id": fee.line_id,
                        "sku": fee.sku,
                        "fee_type": fee.fee_type,
                        "amount": amount,
                        "expected_fee": expected,
                        "delta": delta,
                    }),
                    core_fields,
                },
            ));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LostInventoryRule;

impl Rule for LostInventoryRule {
    fn rule_type(&self) -> RuleType {
        RuleType::LostInventory
    }

    fn apply(
        &self,
        dataset: &SellerDataset,
        ctx: &RuleContext,
    ) -> Result<Vec<CandidateAnomaly>, RuleError> {
        let rule_type = self.rule_type();
        let mut out = Vec::new();
        for record in &dataset.inventory {
            let unit_cost = ensure_finite(rule_type, &record.sku, "unit_cost", record.unit_cost)?;
            let lost_units = unit_shortfall(
                rule_type,
                &record.sku,
                "lost_units",
                record.expected_quantity,
                record.counted_quantity,
            )?;
            let Some(threshold) = ctx.thresholds.triggering(rule_type, lost_units as f64) else {
                continue;
            };
            let mut core_fields = CoreFields::from([
                ("counted_quantity", record.counted_quantity.to_string()),
                ("expected_quantity", record.expected_quantity.to_string()),
                ("sku", record.sku.clone()),
            ]);
            core_fields.insert("vendor", record.vendor.clone().unwrap_or_default());
            let amount = lost_units as f64 * unit_cost;
            out.push(candidate(
                ctx,
                threshold,
                Finding {
                    rule_type,
                    item_id: record.sku.clone(),
                    compared_value: lost_units as f64,
                    amount_discrepancy: amount,
                    summary: format!(
                        "{} units of {} unaccounted for ({} expected, {} counted)",
                        lost_units, record.sku, record.expected_quantity, record.counted_quantity
                    ),
                    identifiers: ScopedIdentifiers {
                        sku: Some(record.sku.clone()),
                        asin: record.asin.clone(),
                        vendor: record.vendor.clone(),
                        ..Default::default()
                    },
                    source_ref: format!("inventory_records:{}", record.sku),
                    details: json!({
                        "sku": record.sku,
                        "vendor": record.vendor,
                        "expected_quantity": record.expected_quantity,
                        "counted_quantity": record.counted_quantity,
                        "lost_units": lost_units,
                        "unit_cost": unit_cost,
                    }),
                    core_fields,
                },
            ));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DamagedInventoryRule;

impl Rule for DamagedInventoryRule {
    fn rule_type(&self) -> RuleType {
        RuleType::DamagedInventory
    }

    fn apply(
        &self,
        dataset: &SellerDataset,
        ctx: &RuleContext,
    ) -> Result<Vec<CandidateAnomaly>, RuleError> {
        let rule_type = self.rule_type();
        let mut out = Vec::new();
        for record in &dataset.damages {
            let unit_value =
                ensure_finite(rule_type, &record.damage_id, "unit_value", record.unit_value)?;
            let reimbursed = ensure_finite(
                rule_type,
                &record.damage_id,
                "reimbursed_amount",
                record.reimbursed_amount,
            )?;
            let owed = record.quantity as f64 * unit_value - reimbursed;
            let Some(threshold) = ctx.thresholds.triggering(rule_type, owed) else {
                continue;
            };
            let core_fields = CoreFields::from([
                ("damage_id", record.damage_id.clone()),
                ("quantity", record.quantity.to_string()),
                ("reimbursed_amount", money(reimbursed)),
                ("sku", record.sku.clone()),
                ("unit_value", money(unit_value)),
            ]);
            out.push(candidate(
                ctx,
                threshold,
                Finding {
                    rule_type,
                    item_id: record.damage_id.clone(),
                    compared_value: owed,
                    amount_discrepancy: owed,
                    summary: format!(
                        "{} damaged units of {} under-reimbursed by {:.2}",
                        record.quantity, record.sku, owed
                    ),
                    identifiers: ScopedIdentifiers {
                        sku: Some(record.sku.clone()),
                        asin: record.asin.clone(),
                        ..Default::default()
                    },
                    source_ref: format!("damage_records:{}", record.damage_id),
                    details: json!({
                        "damage_id": record.damage_id,
                        "sku": record.sku,
                        "quantity": record.quantity,
                        "unit_value": unit_value,
                        "reimbursed_amount": reimbursed,
                        "reason_code": record.reason_code,
                        "owed": owed,
                    }),
                    core_fields,
                },
            ));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShipmentDiscrepancyRule;

impl Rule for ShipmentDiscrepancyRule {
    fn rule_type(&self) -> RuleType {
        RuleType::ShipmentDiscrepancy
    }

    fn apply(
        &self,
        dataset: &SellerDataset,
        ctx: &RuleContext,
    ) -> Result<Vec<CandidateAnomaly>, RuleError> {
        let rule_type = self.rule_type();
        let mut out = Vec::new();
        for record in &dataset.shipments {
            let row_key = format!("{}/{}", record.shipment_id, record.sku);
            let unit_cost = ensure_finite(rule_type, &row_key, "unit_cost", record.unit_cost)?;
            let missing_units = unit_shortfall(
                rule_type,
                &row_key,
                "missing_units",
                record.units_shipped,
                record.units_received,
            )?;
            let Some(threshold) = ctx.thresholds.triggering(rule_type, missing_units as f64) else {
                continue;
            };
            let core_fields = CoreFields::from([
                ("shipment_id", record.shipment_id.clone()),
                ("sku", record.sku.clone()),
                ("units_received", record.units_received.to_string()),
                ("units_shipped", record.units_shipped.to_string()),
            ]);
            out.push(candidate(
                ctx,
                threshold,
                Finding {
                    rule_type,
                    item_id: row_key.clone(),
                    compared_value: missing_units as f64,
                    amount_discrepancy: missing_units as f64 * unit_cost,
                    summary: format!(
                        "shipment {} received {} of {} units of {}",
                        record.shipment_id, record.units_received, record.units_shipped, record.sku
                    ),
                    identifiers: ScopedIdentifiers {
                        sku: Some(record.sku.clone()),
                        asin: record.asin.clone(),
                        vendor: record.vendor.clone(),
                        shipment_id: Some(record.shipment_id.clone()),
                        ..Default::default()
                    },
                    source_ref: format!("shipment_records:{row_key}"),
                    details: json!({
                        "shipment_id": record.shipment_id,
                        "sku": record.sku,
                        "vendor": record.vendor,
                        "units_shipped": record.units_shipped,
                        "units_received": record.units_received,
                        "missing_units": missing_units,
                        "unit_cost": unit_cost,
                    }),
                    core_fields,
                },
            ));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefundWithoutReturnRule;

impl Rule for RefundWithoutReturnRule {
    fn rule_type(&self) -> RuleType {
        RuleType::RefundWithoutReturn
    }

    fn apply(
        &self,
        dataset: &SellerDataset,
        ctx: &RuleContext,
    ) -> Result<Vec<CandidateAnomaly>, RuleError> {
        let rule_type = self.rule_type();
        let mut out = Vec::new();
        for record in &dataset.refunds {
            if record.returned {
                continue;
            }
            let age_days = (ctx.evaluated_at - record.refunded_at).num_days();
            if age_days < REFUND_RETURN_WINDOW_DAYS {
                continue;
            }
            let refund =
                ensure_finite(rule_type, &record.order_id, "refund_amount", record.refund_amount)?;
            let Some(threshold) = ctx.thresholds.triggering(rule_type, refund) else {
                continue;
            };
            let core_fields = CoreFields::from([
                ("order_id", record.order_id.clone()),
                ("refund_amount", money(refund)),
                ("sku", record.sku.clone()),
            ]);
            out.push(candidate(
                ctx,
                threshold,
                Finding {
                    rule_type,
                    item_id: record.order_id.clone(),
                    compared_value: refund,
                    amount_discrepancy: refund,
                    summary: format!(
                        "order {} refunded {:.2} for {} with no return after {} days",
                        record.order_id, refund, record.sku, age_days
                    ),
                    identifiers: ScopedIdentifiers {
                        sku: Some(record.sku.clone()),
                        asin: record.asin.clone(),
                        ..Default::default()
                    },
                    source_ref: format!("refund_records:{}", record.order_id),
                    details: json!({
                        "order_id": record.order_id,
                        "sku": record.sku,
                        "refund_amount": refund,
                        "refunded_at": record.refunded_at,
                        "age_days": age_days,
                    }),
                    core_fields,
                },
            ));
        }
        Ok(out)
    }
}

pub fn rule_for_type(rule_type: RuleType) -> Box<dyn Rule> {
    match rule_type {
        RuleType::OverchargedFees => Box::new(OverchargedFeesRule),
        RuleType::LostInventory => Box::new(LostInventoryRule),
        RuleType::DamagedInventory => Box::new(DamagedInventoryRule),
        RuleType::ShipmentDiscrepancy => Box::new(ShipmentDiscrepancyRule),
        RuleType::RefundWithoutReturn => Box::new(RefundWithoutReturnRule),
    }
}

pub fn default_rules() -> Vec<Box<dyn Rule>> {
    RuleType::ALL.into_iter().map(rule_for_type).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFailure {
    pub rule_type: RuleType,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleEvaluation {
    pub candidates: Vec<CandidateAnomaly>,
    pub failed_rules: Vec<RuleFailure>,
}

pub struct RuleEngine {
    rules: Vec<Box<dyn Rule>>,
    catalog: RuleCatalog,
}

impl RuleEngine {
    /// Built-in rules minus the ones the catalog disables.
    pub fn new(catalog: RuleCatalog) -> Self {
        let rules = default_rules()
            .into_iter()
            .filter(|rule| catalog.is_enabled(rule.rule_type()))
            .collect();
        Self { rules, catalog }
    }

    pub fn with_rules(rules: Vec<Box<dyn Rule>>, catalog: RuleCatalog) -> Self {
        Self { rules, catalog }
    }

    pub fn rule_types(&self) -> Vec<RuleType> {
        self.rules.iter().map(|rule| rule.rule_type()).collect()
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub fn context(
        &self,
        dataset: &SellerDataset,
        thresholds: &[Threshold],
        whitelist: Vec<WhitelistItem>,
        evaluated_at: DateTime<Utc>,
    ) -> RuleContext {
        RuleContext {
            seller_id: dataset.seller_id.clone(),
            account_id: dataset.account_id.clone(),
            thresholds: ThresholdSet::resolve(&dataset.seller_id, thresholds, &self.catalog),
            whitelist,
            evaluated_at,
        }
    }

    /// Runs every rule against the same input. A failing rule is logged and
    /// skipped; the others still run.
    pub fn evaluate(&self, dataset: &SellerDataset, ctx: &RuleContext) -> RuleEvaluation {
        let mut evaluation = RuleEvaluation::default();
        for rule in &self.rules {
            match rule.apply(dataset, ctx) {
                Ok(mut found) => {
                    debug!(
                        rule_type = %rule.rule_type(),
                        candidates = found.len(),
                        "rule evaluated"
                    );
                    evaluation.candidates.append(&mut found);
                }
                Err(err) => {
                    warn!(
                        rule_type = %rule.rule_type(),
                        seller_id = %ctx.seller_id,
                        error = %err,
                        "rule failed, skipping"
                    );
                    evaluation.failed_rules.push(RuleFailure {
                        rule_type: rule.rule_type(),
                        message: err.to_string(),
                    });
                }
            }
        }
        evaluation
    }
}

pub fn load_seller_dataset(path: impl AsRef<Path>) -> Result<SellerDataset> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
