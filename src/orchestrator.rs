//! Task orchestration
//!
//! Owns the task state machine, the bounded-concurrency dispatch loop,
//! fan-out of deduplicated results, cancellation and the end-of-run
//! reconciliation pass that guarantees every submitted line item ends up
//! with exactly one result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::core::aggregate::{placeholder_outcome, score_representatives};
use crate::core::dedup::DedupPlan;
use crate::error::{AuditError, PipelineResult};
use crate::services::registry::{CancelRegistry, CancelToken};
use crate::traits::{MaterialMap, PricingApi, TaskStore};
use crate::types::{
    AuditOutcome, DedupKey, FilterParams, ItemStatus, LineItem, MaterialId, PricingMaterial, Task,
    TaskId, TaskProgress, TaskStatus,
};

/// Shared per-run context threaded through dispatch and reconciliation
struct RunContext {
    task_id: TaskId,
    /// Progress denominator: pre-dedup, post-filter material count
    total: usize,
    /// Canonical identity map, built once per task load
    materials: Arc<MaterialMap>,
    plan: Arc<DedupPlan>,
    region: Option<String>,
    date_range: Option<String>,
    token: CancelToken,
}

/// Orchestrator over injected store and pricing seams
pub struct AuditOrchestrator<S, P> {
    store: Arc<S>,
    pricing: Arc<P>,
    config: OrchestratorConfig,
    registry: CancelRegistry,
}

impl<S, P> AuditOrchestrator<S, P>
where
    S: TaskStore + 'static,
    P: PricingApi + 'static,
{
    pub fn new(store: Arc<S>, pricing: Arc<P>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            pricing,
            config,
            registry: CancelRegistry::new(),
        }
    }

    /// Create a task and kick off processing in the background.
    ///
    /// The run is submitted as a supervised spawn: its error is logged with
    /// task context rather than dropped, and the persisted status reflects
    /// the failure either way.
    pub async fn create_audit_task(
        self: &Arc<Self>,
        materials: Vec<LineItem>,
        params: FilterParams,
    ) -> PipelineResult<TaskId> {
        let task_id = self.store.create_task(materials, &params.label).await?;
        info!(task = %task_id, label = %params.label, "audit task created");

        let orchestrator = Arc::clone(self);
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.run_task(&spawned_id, &params).await {
                error!(task = %spawned_id, %err, "audit task run failed");
            }
        });

        Ok(task_id)
    }

    /// Run one task to a terminal state. Public so callers that want to
    /// await completion (tests, batch drivers) can bypass the spawn.
    pub async fn run_task(&self, task_id: &TaskId, params: &FilterParams) -> PipelineResult<()> {
        let token = self.registry.register(task_id);
        let outcome = self.execute(task_id, params, token).await;
        self.registry.remove(task_id);

        match outcome {
            Ok(status) => {
                info!(task = %task_id, %status, "audit task finished");
                Ok(())
            }
            Err(err) => {
                if let Err(store_err) = self.store.update_status(task_id, TaskStatus::Failed).await
                {
                    warn!(task = %task_id, %store_err, "could not record failed status");
                }
                Err(err)
            }
        }
    }

    pub async fn get_task_status(&self, task_id: &TaskId) -> PipelineResult<TaskProgress> {
        self.store
            .get_progress(task_id)
            .await?
            .ok_or_else(|| AuditError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    pub async fn get_task_results(&self, task_id: &TaskId) -> PipelineResult<Vec<AuditOutcome>> {
        if self.store.get_progress(task_id).await?.is_none() {
            return Err(AuditError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }
        self.store.get_results(task_id).await
    }

    pub async fn list_tasks(&self) -> PipelineResult<Vec<Task>> {
        self.store.list_tasks().await
    }

    /// Request cancellation: flip the persisted status, trip the task's
    /// cancellation tokens so in-flight calls abort, and let the dispatch
    /// loop stop at its next wave boundary. Work already persisted stays.
    /// A task that already reached a terminal state is left untouched.
    pub async fn cancel_task(&self, task_id: &TaskId) -> PipelineResult<()> {
        if let Some(progress) = self.store.get_progress(task_id).await? {
            if progress.status.is_terminal() {
                debug!(task = %task_id, status = %progress.status, "already terminal, cancel ignored");
                return Ok(());
            }
        }
        self.store
            .update_status(task_id, TaskStatus::Cancelled)
            .await?;
        self.registry.cancel(task_id);
        info!(task = %task_id, "cancellation requested");
        Ok(())
    }

    /// Cancel, wait for in-flight calls to abort, then delete with bounded
    /// retries; a concurrent write from the dispatch loop can transiently
    /// conflict with the delete.
    pub async fn cancel_and_delete_task(&self, task_id: &TaskId) -> PipelineResult<()> {
        if self.store.get_progress(task_id).await?.is_none() {
            return Err(AuditError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }
        self.cancel_task(task_id).await?;
        tokio::time::sleep(self.config.delete_delay).await;

        let mut last_err = None;
        for attempt in 1..=self.config.delete_attempts {
            match self.store.delete_task(task_id).await {
                Ok(()) => {
                    info!(task = %task_id, "task deleted");
                    return Ok(());
                }
                Err(err) => {
                    warn!(task = %task_id, attempt, %err, "delete attempt failed");
                    last_err = Some(err);
                    if attempt < self.config.delete_attempts {
                        tokio::time::sleep(self.config.delete_delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AuditError::Store {
            operation: "delete_task".to_string(),
            message: "delete failed".to_string(),
        }))
    }

    async fn execute(
        &self,
        task_id: &TaskId,
        params: &FilterParams,
        token: CancelToken,
    ) -> PipelineResult<TaskStatus> {
        let record = self.load_task(task_id).await?;
        if record.materials.is_empty() {
            return Err(AuditError::EmptyMaterialSet {
                task_id: task_id.to_string(),
            });
        }

        let materials = Arc::new(record.materials);

        // Category filter; excluded rows leave both the denominator and
        // the dispatch set.
        let filtered: Vec<MaterialId> = materials
            .iter()
            .filter(|(_, item)| params.allows(&item.category))
            .map(|(id, _)| id.clone())
            .collect();

        let total = filtered.len();
        self.store.update_total_materials(task_id, total).await?;
        info!(task = %task_id, total, "denominator fixed to pre-dedup post-filter count");

        let plan = Arc::new(DedupPlan::build(&filtered, &materials));
        info!(
            task = %task_id,
            representatives = plan.group_count(),
            duplicates = total.saturating_sub(plan.group_count()),
            "dedup grouping complete"
        );

        self.store
            .update_status(task_id, TaskStatus::Processing)
            .await?;

        let groups: Vec<Vec<MaterialId>> = plan
            .dispatch()
            .chunks(self.config.group_size.max(1))
            .map(<[MaterialId]>::to_vec)
            .collect();

        let ctx = RunContext {
            task_id: task_id.clone(),
            total,
            materials: Arc::clone(&materials),
            plan: Arc::clone(&plan),
            region: params.region.clone(),
            date_range: params.formatted_date_range(),
            token,
        };

        info!(
            task = %task_id,
            groups = groups.len(),
            group_size = self.config.group_size,
            concurrency = self.config.wave_concurrency,
            "dispatch starting"
        );

        let mut wave_start = 0usize;
        while wave_start < groups.len() {
            // Cancellation is cooperative: checked between waves, while
            // in-flight calls abort through their tokens.
            if self.is_cancelled(&ctx).await {
                info!(task = %task_id, "task cancelled, skipping remaining waves");
                return Ok(TaskStatus::Cancelled);
            }

            let wave_end = (wave_start + self.config.wave_concurrency.max(1)).min(groups.len());
            debug!(task = %task_id, wave_start, wave_end, "processing wave");

            let wave = groups[wave_start..wave_end]
                .iter()
                .enumerate()
                .map(|(offset, group)| {
                    let ctx = &ctx;
                    let group_index = wave_start + offset;
                    let stagger = self.config.stagger_step * offset as u32;
                    async move {
                        // Stagger starts within the wave to avoid a
                        // synchronized burst against the service.
                        if !stagger.is_zero() {
                            tokio::time::sleep(stagger).await;
                        }
                        self.process_group(ctx, group_index, group).await
                    }
                });

            for result in join_all(wave).await {
                result?;
            }

            wave_start = wave_end;
            if wave_start < groups.len() && !self.config.wave_pause.is_zero() {
                tokio::time::sleep(self.config.wave_pause).await;
            }
        }

        if self.is_cancelled(&ctx).await {
            info!(task = %task_id, "task cancelled after final wave");
            return Ok(TaskStatus::Cancelled);
        }

        self.reconcile(&ctx, &filtered).await?;

        self.store
            .update_status(task_id, TaskStatus::Completed)
            .await?;
        if let Err(err) = self.store.update_progress(task_id, 100).await {
            warn!(task = %task_id, %err, "final progress update failed");
        }
        Ok(TaskStatus::Completed)
    }

    /// Persistence may lag task creation; retry the lookup a bounded
    /// number of times before treating the miss as fatal.
    async fn load_task(&self, task_id: &TaskId) -> PipelineResult<crate::types::TaskRecord> {
        for attempt in 1..=self.config.lookup_attempts.max(1) {
            if let Some(record) = self.store.get_task(task_id).await? {
                if attempt > 1 {
                    debug!(task = %task_id, attempt, "task lookup succeeded after retry");
                }
                return Ok(record);
            }
            warn!(task = %task_id, attempt, "task lookup miss");
            if attempt < self.config.lookup_attempts {
                tokio::time::sleep(self.config.lookup_delay).await;
            }
        }
        Err(AuditError::TaskNotFound {
            task_id: task_id.to_string(),
        })
    }

    async fn is_cancelled(&self, ctx: &RunContext) -> bool {
        if ctx.token.is_cancelled() {
            return true;
        }
        matches!(
            self.store.get_progress(&ctx.task_id).await,
            Ok(Some(progress)) if progress.status == TaskStatus::Cancelled
        )
    }

    /// Process one dispatch group: call the pricing service, score the
    /// representatives, fan the outcome out to every dedup-group member and
    /// persist. Upstream failures stay local to the group; persistence
    /// failures propagate because correctness depends on them.
    async fn process_group(
        &self,
        ctx: &RunContext,
        group_index: usize,
        group: &[MaterialId],
    ) -> PipelineResult<()> {
        let payload: Vec<PricingMaterial> = group
            .iter()
            .filter_map(|id| {
                ctx.materials
                    .get(id)
                    .map(|item| PricingMaterial::new(id, item))
            })
            .collect();
        if payload.is_empty() {
            return Ok(());
        }

        let outcomes = match self
            .pricing
            .recommend(
                &payload,
                ctx.region.as_deref(),
                ctx.date_range.as_deref(),
                ctx.token.clone(),
            )
            .await
        {
            Ok(recommendations) => {
                score_representatives(recommendations, group, &ctx.materials)
            }
            Err(err @ AuditError::Config { .. }) => return Err(err),
            Err(err) => {
                warn!(
                    task = %ctx.task_id,
                    group = group_index,
                    materials = ?group,
                    %err,
                    "group lookup failed, recording failed placeholders"
                );
                group
                    .iter()
                    .filter_map(|id| {
                        ctx.materials.get(id).map(|item| {
                            placeholder_outcome(id.clone(), item.clone(), ItemStatus::Failed)
                        })
                    })
                    .collect()
            }
        };

        let expanded = self.fan_out(ctx, outcomes);
        if expanded.is_empty() {
            return Ok(());
        }

        let count = self.store.upsert_results(&ctx.task_id, expanded).await?;
        self.refresh_progress(ctx, count).await;
        Ok(())
    }

    /// Copy each representative's outcome onto every member identity in
    /// its dedup group, skipping identities already written in this pass.
    fn fan_out(&self, ctx: &RunContext, outcomes: Vec<AuditOutcome>) -> Vec<AuditOutcome> {
        let mut expanded = Vec::new();
        let mut written: HashSet<MaterialId> = HashSet::new();

        for outcome in outcomes {
            let members = ctx.plan.members_of(&outcome.material_id);
            if members.is_empty() {
                // not a representative we know; keep the result as-is
                if written.insert(outcome.material_id.clone()) {
                    expanded.push(outcome);
                }
                continue;
            }
            for member in members {
                if !written.insert(member.clone()) {
                    continue;
                }
                let Some(item) = ctx.materials.get(member) else {
                    warn!(task = %ctx.task_id, material = %member, "member identity missing from material set");
                    continue;
                };
                expanded.push(outcome.copy_for(member.clone(), item.clone()));
            }
        }
        expanded
    }

    /// Backfill every original identity still missing a result. The
    /// representative's persisted result is authoritative for its group
    /// even when it is itself a failure placeholder; only when no
    /// representative result exists at all does a fresh failed placeholder
    /// get written.
    async fn reconcile(&self, ctx: &RunContext, filtered: &[MaterialId]) -> PipelineResult<()> {
        let persisted = self.store.get_results(&ctx.task_id).await?;
        if persisted.len() >= ctx.total {
            return Ok(());
        }
        info!(
            task = %ctx.task_id,
            persisted = persisted.len(),
            total = ctx.total,
            "reconciling missing results"
        );

        let by_id: HashMap<&MaterialId, &AuditOutcome> = persisted
            .iter()
            .map(|outcome| (&outcome.material_id, outcome))
            .collect();

        let mut backfill = Vec::new();
        for id in filtered {
            if by_id.contains_key(id) {
                continue;
            }
            let Some(item) = ctx.materials.get(id) else {
                continue;
            };
            let key = DedupKey::of(item);
            let representative = ctx
                .plan
                .representative_for(&key)
                .and_then(|rep| by_id.get(rep));
            match representative {
                Some(rep_outcome) => {
                    debug!(task = %ctx.task_id, material = %id, "backfilling from representative result");
                    backfill.push(rep_outcome.copy_for(id.clone(), item.clone()));
                }
                None => {
                    warn!(task = %ctx.task_id, material = %id, "no representative result, writing failed placeholder");
                    backfill.push(placeholder_outcome(
                        id.clone(),
                        item.clone(),
                        ItemStatus::Failed,
                    ));
                }
            }
        }

        if !backfill.is_empty() {
            let count = self.store.upsert_results(&ctx.task_id, backfill).await?;
            self.refresh_progress(ctx, count).await;
        }
        Ok(())
    }

    /// Metadata update, best-effort: a failed progress write never fails
    /// the run.
    async fn refresh_progress(&self, ctx: &RunContext, result_count: usize) {
        let pct = progress_pct(result_count, ctx.total);
        if let Err(err) = self.store.update_progress(&ctx.task_id, pct).await {
            warn!(task = %ctx.task_id, %err, "progress update failed");
        } else {
            debug!(task = %ctx.task_id, result_count, total = ctx.total, pct, "progress updated");
        }
    }
}

fn progress_pct(result_count: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (result_count as f64 / total as f64 * 100.0).round();
    pct.min(100.0) as u8
}
