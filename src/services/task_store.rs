//! In-memory task store
//!
//! Reference implementation of the `TaskStore` seam: a process-local,
//! concurrency-safe row store with the same upsert and cascade semantics a
//! relational backend would provide. Results are keyed by material
//! identity, so repeated writes for the same identity collapse into one.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{AuditError, PipelineResult};
use crate::traits::TaskStore;
use crate::types::{
    AuditOutcome, LineItem, MaterialId, Task, TaskId, TaskProgress, TaskRecord, TaskStatus,
};

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<TaskId, Task>,
    materials: HashMap<TaskId, BTreeMap<MaterialId, LineItem>>,
    results: HashMap<TaskId, BTreeMap<MaterialId, AuditOutcome>>,
    /// Creation order, oldest first
    order: Vec<TaskId>,
}

/// Task store backed by in-process maps behind a single `RwLock`
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: RwLock<StoreInner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(task_id: &TaskId) -> AuditError {
    AuditError::TaskNotFound {
        task_id: task_id.to_string(),
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, materials: Vec<LineItem>, label: &str) -> PipelineResult<TaskId> {
        let task_id = TaskId::new();
        let now = Utc::now();
        let total = materials.len();

        let mut map = BTreeMap::new();
        for (index, item) in materials.into_iter().enumerate() {
            map.insert(MaterialId::from_position(index), item);
        }

        let task = Task {
            id: task_id.clone(),
            label: label.to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            total_materials: total,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.write().await;
        inner.tasks.insert(task_id.clone(), task);
        inner.materials.insert(task_id.clone(), map);
        inner.results.insert(task_id.clone(), BTreeMap::new());
        inner.order.push(task_id.clone());

        debug!(task = %task_id, materials = total, "task created");
        Ok(task_id)
    }

    async fn get_task(&self, task_id: &TaskId) -> PipelineResult<Option<TaskRecord>> {
        let inner = self.inner.read().await;
        let Some(task) = inner.tasks.get(task_id) else {
            return Ok(None);
        };
        let materials = inner.materials.get(task_id).cloned().unwrap_or_default();
        let results = inner
            .results
            .get(task_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        Ok(Some(TaskRecord {
            task: task.clone(),
            materials,
            results,
        }))
    }

    async fn update_status(&self, task_id: &TaskId, status: TaskStatus) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(task_id).ok_or_else(|| not_found(task_id))?;
        task.status = status;
        task.updated_at = Utc::now();
        debug!(task = %task_id, %status, "status updated");
        Ok(())
    }

    async fn update_progress(&self, task_id: &TaskId, progress: u8) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(task_id).ok_or_else(|| not_found(task_id))?;
        task.progress = progress.min(100);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn update_total_materials(&self, task_id: &TaskId, total: usize) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(task_id).ok_or_else(|| not_found(task_id))?;
        task.total_materials = total;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn upsert_results(
        &self,
        task_id: &TaskId,
        results: Vec<AuditOutcome>,
    ) -> PipelineResult<usize> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(task_id) {
            return Err(not_found(task_id));
        }
        let rows = inner.results.entry(task_id.clone()).or_default();
        let written = results.len();
        for outcome in results {
            rows.insert(outcome.material_id.clone(), outcome);
        }
        let count = rows.len();
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.updated_at = Utc::now();
        }
        debug!(task = %task_id, written, persisted = count, "results upserted");
        Ok(count)
    }

    async fn get_progress(&self, task_id: &TaskId) -> PipelineResult<Option<TaskProgress>> {
        let inner = self.inner.read().await;
        let Some(task) = inner.tasks.get(task_id) else {
            return Ok(None);
        };
        let result_count = inner.results.get(task_id).map(BTreeMap::len).unwrap_or(0);
        Ok(Some(TaskProgress {
            status: task.status,
            progress: task.progress,
            result_count,
            total_materials: task.total_materials,
        }))
    }

    async fn get_results(&self, task_id: &TaskId) -> PipelineResult<Vec<AuditOutcome>> {
        let inner = self.inner.read().await;
        Ok(inner
            .results
            .get(task_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_tasks(&self) -> PipelineResult<Vec<Task>> {
        let inner = self.inner.read().await;
        Ok(inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect())
    }

    async fn delete_task(&self, task_id: &TaskId) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;
        inner.tasks.remove(task_id);
        inner.materials.remove(task_id);
        inner.results.remove(task_id);
        inner.order.retain(|id| id != task_id);
        debug!(task = %task_id, "task deleted");
        Ok(())
    }
}
