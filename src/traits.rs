//! Trait seams for the task store and the pricing service
//!
//! Both collaborators are injected into the orchestrator behind these
//! traits, with mockall mocks generated for testing.

use std::collections::BTreeMap;

use crate::error::PipelineResult;
use crate::services::registry::CancelToken;
use crate::types::{
    AuditOutcome, LineItem, MaterialId, PricingMaterial, Recommendation, Task, TaskId,
    TaskProgress, TaskRecord, TaskStatus,
};

/// Persistence seam for tasks, line-item identity assignments and results.
///
/// Every write is an upsert keyed by `(task id, material id)` or by task id
/// for metadata, so interleaved writers are safe without external locking.
#[mockall::automock]
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task, assigning a stable material identity to each
    /// line item by position. Returns the task identity.
    async fn create_task(&self, materials: Vec<LineItem>, label: &str) -> PipelineResult<TaskId>;

    /// Load task metadata together with the canonical identity map and any
    /// persisted results
    async fn get_task(&self, task_id: &TaskId) -> PipelineResult<Option<TaskRecord>>;

    async fn update_status(&self, task_id: &TaskId, status: TaskStatus) -> PipelineResult<()>;

    /// Set progress (clamped to 0-100)
    async fn update_progress(&self, task_id: &TaskId, progress: u8) -> PipelineResult<()>;

    /// Fix the progress denominator to the pre-dedup, post-filter count
    async fn update_total_materials(&self, task_id: &TaskId, total: usize) -> PipelineResult<()>;

    /// Idempotent per material identity; returns the persisted-result count
    /// for the task after the write
    async fn upsert_results(
        &self,
        task_id: &TaskId,
        results: Vec<AuditOutcome>,
    ) -> PipelineResult<usize>;

    async fn get_progress(&self, task_id: &TaskId) -> PipelineResult<Option<TaskProgress>>;

    /// Results ordered by material identity
    async fn get_results(&self, task_id: &TaskId) -> PipelineResult<Vec<AuditOutcome>>;

    /// All tasks, newest first
    async fn list_tasks(&self) -> PipelineResult<Vec<Task>>;

    /// Delete the task, cascading to its materials and results
    async fn delete_task(&self, task_id: &TaskId) -> PipelineResult<()>;
}

/// Client seam for the external pricing-recommendation service.
///
/// One call covers one dispatch group; the service's internal batching is
/// opaque to us. Calls carry a cancellation token that aborts the in-flight
/// attempt and skips remaining retries.
#[mockall::automock]
#[async_trait::async_trait]
pub trait PricingApi: Send + Sync {
    async fn recommend<'a>(
        &self,
        materials: &[PricingMaterial],
        region: Option<&'a str>,
        date_range: Option<&'a str>,
        token: CancelToken,
    ) -> PipelineResult<Vec<Recommendation>>;
}

/// Convenience alias used when threading the canonical identity map around
pub type MaterialMap = BTreeMap<MaterialId, LineItem>;
