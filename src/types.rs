//! Core data types shared across the audit pipeline
//!
//! Line items, material identities, tasks and audit outcomes live here,
//! together with the wire types exchanged with the external pricing service.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier for an audit task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh task identifier
    pub fn new() -> Self {
        Self(format!("task_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn from_string(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable per-task token bound to one line item.
///
/// Identities are assigned densely at task creation (`0001`, `0002`, ...)
/// from the line item's position and are never reassigned afterwards. They
/// are the persistence key and the correlation key sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MaterialId(String);

impl MaterialId {
    /// Identity for the line item at `index` within the submitted sequence
    pub fn from_position(index: usize) -> Self {
        Self(format!("{:04}", index + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MaterialId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for MaterialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of submitted material data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub ordinal: u32,
    pub code: String,
    pub category: String,
    pub name: String,
    pub spec: String,
    pub unit: String,
    pub quantity: f64,
    /// Declared market price, tax excluded
    pub market_price: f64,
    pub tax_rate: f64,
    pub total_price: f64,
}

/// Key under which audit-equivalent line items are merged.
///
/// Two line items with equal keys must receive byte-identical
/// recommendation output; only their identity and source fields differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn of(item: &LineItem) -> Self {
        Self(format!(
            "{}|{}|{}|{}",
            item.code, item.spec, item.unit, item.market_price
        ))
    }
}

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Status of a single material's price lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    InProgress,
    Complete,
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InProgress => "in-progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Task metadata as persisted by the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub status: TaskStatus,
    /// 0-100, recomputed after every persisted batch
    pub progress: u8,
    /// Denominator for progress: the pre-dedup, post-filter material count
    pub total_materials: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Progress snapshot exposed to pollers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub status: TaskStatus,
    pub progress: u8,
    pub result_count: usize,
    pub total_materials: usize,
}

/// Full task record: metadata plus the canonical identity map and results
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: Task,
    /// Canonical identity -> line item map, in identity (= submission) order
    pub materials: BTreeMap<MaterialId, LineItem>,
    pub results: Vec<AuditOutcome>,
}

/// Audit result for one material identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditOutcome {
    pub material_id: MaterialId,
    #[serde(flatten)]
    pub item: LineItem,
    /// Human-formatted recommended range, e.g. `"10.38～15.64"`, or `"no-data"`
    pub price_range: String,
    /// Signed percentage label, empty when within range
    pub deviation: String,
    /// Unrounded deviation percentage, zero when within range
    pub deviation_value: f64,
    pub status: ItemStatus,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
}

impl AuditOutcome {
    /// Clone this outcome onto another member of the same dedup group.
    /// Only the identity and the source line-item fields change.
    pub fn copy_for(&self, material_id: MaterialId, item: LineItem) -> Self {
        Self {
            material_id,
            item,
            price_range: self.price_range.clone(),
            deviation: self.deviation.clone(),
            deviation_value: self.deviation_value,
            status: self.status,
            recommendations: self.recommendations.clone(),
        }
    }
}

/// Material descriptor sent to the pricing service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingMaterial {
    pub id: MaterialId,
    pub name: String,
    pub spec: String,
    pub unit: String,
}

impl PricingMaterial {
    pub fn new(id: &MaterialId, item: &LineItem) -> Self {
        Self {
            id: id.clone(),
            name: item.name.clone(),
            spec: item.spec.clone(),
            unit: item.unit.clone(),
        }
    }
}

/// One recommendation record returned by the pricing service.
///
/// Amounts and rates arrive as strings (including `"NULL"` and `"0.00"`
/// sentinels); parsing and defaulting happen in the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Record id in the upstream database
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub spec: String,
    /// Unit, as the upstream service names it
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub tax_include_amount: Option<String>,
    #[serde(default)]
    pub tax_exclude_amount: Option<String>,
    #[serde(default)]
    pub tax_rate: Option<String>,
    #[serde(default)]
    pub publish_date: Option<String>,
    /// Price type tag, string or number upstream
    #[serde(default)]
    pub source: Option<serde_json::Value>,
    /// Acquisition channel tag, string or number upstream
    #[serde(default)]
    pub get_way: Option<serde_json::Value>,
    /// Correlates the record back to the material identity we pushed
    #[serde(rename = "ID")]
    pub correlation_id: String,
    /// Unit-conversion weight applied to the amount
    #[serde(default)]
    pub w: Option<String>,
}

/// Response envelope from the pricing service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecommendEnvelope {
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub data: Option<RunData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunData {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub outputs: Option<RunOutputs>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunOutputs {
    /// JSON-encoded array of recommendation records
    #[serde(default)]
    pub text: Option<String>,
}

/// Caller-supplied parameters scoping an audit run
#[derive(Debug, Clone, Default)]
pub struct FilterParams {
    /// Display label for the task, typically the source file name
    pub label: String,
    /// Category allow-list; `None` or empty means no filtering
    pub categories: Option<Vec<String>>,
    /// City code forwarded verbatim to the pricing service. Callers
    /// resolve human-readable region names to codes before submitting.
    pub region: Option<String>,
    /// Inclusive month range, `("YYYY-MM", "YYYY-MM")`
    pub month_range: Option<(String, String)>,
}

impl FilterParams {
    pub fn allows(&self, category: &str) -> bool {
        match &self.categories {
            Some(wanted) if !wanted.is_empty() => wanted.iter().any(|c| c == category),
            _ => true,
        }
    }

    /// Date-range string for the pricing service, `"YYYY-MM-01|YYYY-MM-<last>"`
    pub fn formatted_date_range(&self) -> Option<String> {
        let (start, end) = self.month_range.as_ref()?;
        format_month_range(start, end)
    }
}

/// Expand an inclusive month range into a pipe-separated day range,
/// ending on the last day of the final month.
pub fn format_month_range(start: &str, end: &str) -> Option<String> {
    let first = NaiveDate::parse_from_str(&format!("{start}-01"), "%Y-%m-%d").ok()?;
    let end_first = NaiveDate::parse_from_str(&format!("{end}-01"), "%Y-%m-%d").ok()?;
    let next_month = if end_first.month() == 12 {
        NaiveDate::from_ymd_opt(end_first.year() + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(end_first.year(), end_first.month() + 1, 1)?
    };
    let last = next_month.pred_opt()?;
    Some(format!(
        "{}|{}",
        first.format("%Y-%m-%d"),
        last.format("%Y-%m-%d")
    ))
}
