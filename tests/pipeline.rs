//! End-to-end pipeline tests over the in-memory store and a scripted
//! pricing service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use priceaudit::config::OrchestratorConfig;
use priceaudit::error::{AuditError, PipelineResult};
use priceaudit::orchestrator::AuditOrchestrator;
use priceaudit::services::registry::CancelToken;
use priceaudit::services::MemoryTaskStore;
use priceaudit::traits::{PricingApi, TaskStore};
use priceaudit::types::{
    AuditOutcome, FilterParams, ItemStatus, LineItem, PricingMaterial, Recommendation, Task,
    TaskId, TaskProgress, TaskRecord, TaskStatus,
};

fn item(code: &str, category: &str, market_price: f64) -> LineItem {
    LineItem {
        ordinal: 0,
        code: code.to_string(),
        category: category.to_string(),
        name: format!("material {code}"),
        spec: "spec".to_string(),
        unit: "t".to_string(),
        quantity: 1.0,
        market_price,
        tax_rate: 13.0,
        total_price: market_price,
    }
}

fn quick_config() -> OrchestratorConfig {
    OrchestratorConfig {
        stagger_step: Duration::ZERO,
        wave_pause: Duration::ZERO,
        lookup_delay: Duration::from_millis(1),
        delete_delay: Duration::from_millis(1),
        ..Default::default()
    }
}

/// What the scripted service does for a given material name
#[derive(Clone)]
enum Script {
    /// Return a single recommendation priced at this untaxed amount
    Price(f64),
    /// Fail the call (after the orchestrator-visible retry budget)
    Fail,
    /// Block until the cancellation token trips, then report cancellation
    Hang,
}

/// Pricing fake scripted per material name; records every dispatched name
struct ScriptedPricing {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedPricing {
    fn new(scripts: Vec<(&str, Script)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(name, script)| (name.to_string(), script))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PricingApi for ScriptedPricing {
    async fn recommend<'a>(
        &self,
        materials: &[PricingMaterial],
        _region: Option<&'a str>,
        _date_range: Option<&'a str>,
        token: CancelToken,
    ) -> PipelineResult<Vec<Recommendation>> {
        let mut out = Vec::new();
        for material in materials {
            self.calls.lock().unwrap().push(material.name.clone());
            match self.scripts.get(&material.name) {
                Some(Script::Price(price)) => out.push(Recommendation {
                    tax_exclude_amount: Some(format!("{price:.2}")),
                    w: Some("1".to_string()),
                    correlation_id: material.id.to_string(),
                    ..Default::default()
                }),
                Some(Script::Fail) => {
                    return Err(AuditError::Upstream {
                        attempts: 3,
                        message: "scripted failure".to_string(),
                    })
                }
                Some(Script::Hang) => {
                    token.cancelled().await;
                    return Err(AuditError::Cancelled);
                }
                None => {}
            }
        }
        Ok(out)
    }
}

/// Store wrapper that drops all but the first outcome of the first upsert,
/// simulating a partial write that the reconciliation pass must repair.
struct TruncatingStore {
    inner: MemoryTaskStore,
    truncated: AtomicBool,
}

impl TruncatingStore {
    fn new() -> Self {
        Self {
            inner: MemoryTaskStore::new(),
            truncated: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TaskStore for TruncatingStore {
    async fn create_task(&self, materials: Vec<LineItem>, label: &str) -> PipelineResult<TaskId> {
        self.inner.create_task(materials, label).await
    }

    async fn get_task(&self, task_id: &TaskId) -> PipelineResult<Option<TaskRecord>> {
        self.inner.get_task(task_id).await
    }

    async fn update_status(&self, task_id: &TaskId, status: TaskStatus) -> PipelineResult<()> {
        self.inner.update_status(task_id, status).await
    }

    async fn update_progress(&self, task_id: &TaskId, progress: u8) -> PipelineResult<()> {
        self.inner.update_progress(task_id, progress).await
    }

    async fn update_total_materials(&self, task_id: &TaskId, total: usize) -> PipelineResult<()> {
        self.inner.update_total_materials(task_id, total).await
    }

    async fn upsert_results(
        &self,
        task_id: &TaskId,
        mut results: Vec<AuditOutcome>,
    ) -> PipelineResult<usize> {
        if !self.truncated.swap(true, Ordering::SeqCst) {
            results.truncate(1);
        }
        self.inner.upsert_results(task_id, results).await
    }

    async fn get_progress(&self, task_id: &TaskId) -> PipelineResult<Option<TaskProgress>> {
        self.inner.get_progress(task_id).await
    }

    async fn get_results(&self, task_id: &TaskId) -> PipelineResult<Vec<AuditOutcome>> {
        self.inner.get_results(task_id).await
    }

    async fn list_tasks(&self) -> PipelineResult<Vec<Task>> {
        self.inner.list_tasks().await
    }

    async fn delete_task(&self, task_id: &TaskId) -> PipelineResult<()> {
        self.inner.delete_task(task_id).await
    }
}

async fn wait_for_status(
    orchestrator: &AuditOrchestrator<MemoryTaskStore, ScriptedPricing>,
    task_id: &TaskId,
    wanted: TaskStatus,
) -> TaskProgress {
    for _ in 0..200 {
        let progress = orchestrator.get_task_status(task_id).await.unwrap();
        if progress.status == wanted {
            return progress;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task never reached {wanted}");
}

#[tokio::test]
async fn duplicates_share_one_call_and_failures_stay_local() {
    let store = Arc::new(MemoryTaskStore::new());
    let pricing = Arc::new(ScriptedPricing::new(vec![
        ("material A", Script::Fail),
        ("material B", Script::Price(20.0)),
    ]));
    let orchestrator =
        AuditOrchestrator::new(Arc::clone(&store), Arc::clone(&pricing), quick_config());

    // four audit-equivalent rows of A plus one distinct row of B
    let materials = vec![
        item("A", "steel", 10.0),
        item("A", "steel", 10.0),
        item("B", "steel", 25.0),
        item("A", "steel", 10.0),
        item("A", "steel", 10.0),
    ];
    let task_id = store.create_task(materials, "demo.xlsx").await.unwrap();
    orchestrator
        .run_task(&task_id, &FilterParams::default())
        .await
        .unwrap();

    // one upstream call per dedup group, not per row
    assert_eq!(pricing.call_count(), 2);

    let progress = orchestrator.get_task_status(&task_id).await.unwrap();
    assert_eq!(progress.status, TaskStatus::Completed);
    assert_eq!(progress.progress, 100);
    assert_eq!(progress.total_materials, 5);
    assert_eq!(progress.result_count, 5);

    let results = orchestrator.get_task_results(&task_id).await.unwrap();
    assert_eq!(results.len(), 5);

    // the failed group's placeholder reached every member
    let failed: Vec<_> = results.iter().filter(|r| r.item.code == "A").collect();
    assert_eq!(failed.len(), 4);
    for outcome in failed {
        assert_eq!(outcome.status, ItemStatus::Failed);
        assert_eq!(outcome.price_range, "no-data");
    }

    let ok = results.iter().find(|r| r.item.code == "B").unwrap();
    assert_eq!(ok.status, ItemStatus::Complete);
    assert_eq!(ok.price_range, "20.00～20.00");
    assert_eq!(ok.deviation, "+25.00%");
}

#[tokio::test]
async fn category_filter_fixes_the_denominator() {
    let store = Arc::new(MemoryTaskStore::new());
    let pricing = Arc::new(ScriptedPricing::new(vec![
        ("material A", Script::Price(10.0)),
        ("material B", Script::Price(3.0)),
        ("material C", Script::Price(99.0)),
    ]));
    let orchestrator =
        AuditOrchestrator::new(Arc::clone(&store), Arc::clone(&pricing), quick_config());

    let materials = vec![
        item("A", "steel", 10.0),
        item("C", "cement", 100.0),
        item("B", "steel", 3.0),
    ];
    let task_id = store.create_task(materials, "demo").await.unwrap();
    let params = FilterParams {
        categories: Some(vec!["steel".to_string()]),
        ..Default::default()
    };
    orchestrator.run_task(&task_id, &params).await.unwrap();

    // the cement row never reached the service and counts for nothing
    assert_eq!(pricing.call_count(), 2);
    let progress = orchestrator.get_task_status(&task_id).await.unwrap();
    assert_eq!(progress.status, TaskStatus::Completed);
    assert_eq!(progress.total_materials, 2);
    assert_eq!(progress.result_count, 2);

    let results = orchestrator.get_task_results(&task_id).await.unwrap();
    assert!(results.iter().all(|r| r.item.category == "steel"));
}

#[tokio::test]
async fn cancellation_aborts_inflight_calls_and_keeps_partial_results() {
    let store = Arc::new(MemoryTaskStore::new());
    let pricing = Arc::new(ScriptedPricing::new(vec![
        ("material A", Script::Hang),
        ("material B", Script::Hang),
        ("material C", Script::Hang),
    ]));
    // one group per wave, so cancellation leaves later waves unstarted
    let orchestrator = Arc::new(AuditOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&pricing),
        OrchestratorConfig {
            wave_concurrency: 1,
            ..quick_config()
        },
    ));

    let materials = vec![
        item("A", "steel", 10.0),
        item("B", "steel", 3.0),
        item("C", "steel", 7.0),
    ];
    let task_id = orchestrator
        .create_audit_task(materials, FilterParams::default())
        .await
        .unwrap();

    wait_for_status(&orchestrator, &task_id, TaskStatus::Processing).await;
    orchestrator.cancel_task(&task_id).await.unwrap();
    let progress = wait_for_status(&orchestrator, &task_id, TaskStatus::Cancelled).await;

    // the wave in flight when the token tripped wrote a failed placeholder;
    // unstarted waves never dispatched and reconciliation never ran
    assert_eq!(progress.status, TaskStatus::Cancelled);
    assert!(pricing.call_count() <= 1);
    let results = orchestrator.get_task_results(&task_id).await.unwrap();
    assert!(results.len() <= 1);
    assert!(results.iter().all(|r| r.status == ItemStatus::Failed));
}

#[tokio::test]
async fn reconciliation_backfills_members_from_the_representative() {
    let store = Arc::new(TruncatingStore::new());
    let pricing = Arc::new(ScriptedPricing::new(vec![(
        "material A",
        Script::Price(12.0),
    )]));
    let orchestrator =
        AuditOrchestrator::new(Arc::clone(&store), Arc::clone(&pricing), quick_config());

    let materials = vec![
        item("A", "steel", 12.0),
        item("A", "steel", 12.0),
        item("A", "steel", 12.0),
    ];
    let task_id = store.create_task(materials, "demo").await.unwrap();
    orchestrator
        .run_task(&task_id, &FilterParams::default())
        .await
        .unwrap();

    // the truncated fan-out write persisted one row; reconciliation copied
    // the representative's result to the other two without another call
    assert_eq!(pricing.call_count(), 1);
    let results = store.get_results(&task_id).await.unwrap();
    assert_eq!(results.len(), 3);
    for outcome in &results {
        assert_eq!(outcome.status, ItemStatus::Complete);
        assert_eq!(outcome.price_range, "12.00～12.00");
        assert!(outcome.deviation.is_empty());
    }

    let progress = store.get_progress(&task_id).await.unwrap().unwrap();
    assert_eq!(progress.status, TaskStatus::Completed);
    assert_eq!(progress.progress, 100);
}

#[tokio::test]
async fn reconciliation_treats_failed_representative_as_authoritative() {
    let store = Arc::new(TruncatingStore::new());
    let pricing = Arc::new(ScriptedPricing::new(vec![("material A", Script::Fail)]));
    let orchestrator =
        AuditOrchestrator::new(Arc::clone(&store), Arc::clone(&pricing), quick_config());

    let materials = vec![item("A", "steel", 12.0), item("A", "steel", 12.0)];
    let task_id = store.create_task(materials, "demo").await.unwrap();
    orchestrator
        .run_task(&task_id, &FilterParams::default())
        .await
        .unwrap();

    // the representative's failure placeholder is copied, not re-dispatched
    assert_eq!(pricing.call_count(), 1);
    let results = store.get_results(&task_id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == ItemStatus::Failed));

    let progress = store.get_progress(&task_id).await.unwrap().unwrap();
    assert_eq!(progress.status, TaskStatus::Completed);
}

#[tokio::test]
async fn configuration_errors_fail_the_whole_task() {
    struct Misconfigured;

    #[async_trait]
    impl PricingApi for Misconfigured {
        async fn recommend<'a>(
            &self,
            _materials: &[PricingMaterial],
            _region: Option<&'a str>,
            _date_range: Option<&'a str>,
            _token: CancelToken,
        ) -> PipelineResult<Vec<Recommendation>> {
            Err(AuditError::Config {
                field: "PRICING_API_KEY".to_string(),
            })
        }
    }

    let store = Arc::new(MemoryTaskStore::new());
    let orchestrator =
        AuditOrchestrator::new(Arc::clone(&store), Arc::new(Misconfigured), quick_config());

    let task_id = store
        .create_task(vec![item("A", "steel", 10.0)], "demo")
        .await
        .unwrap();
    let err = orchestrator
        .run_task(&task_id, &FilterParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::Config { .. }));

    let progress = store.get_progress(&task_id).await.unwrap().unwrap();
    assert_eq!(progress.status, TaskStatus::Failed);
}

#[tokio::test]
async fn cancel_and_delete_removes_every_trace() {
    let store = Arc::new(MemoryTaskStore::new());
    let pricing = Arc::new(ScriptedPricing::new(vec![("material A", Script::Hang)]));
    let orchestrator = Arc::new(AuditOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&pricing),
        quick_config(),
    ));

    let task_id = orchestrator
        .create_audit_task(vec![item("A", "steel", 10.0)], FilterParams::default())
        .await
        .unwrap();
    wait_for_status(&orchestrator, &task_id, TaskStatus::Processing).await;

    orchestrator.cancel_and_delete_task(&task_id).await.unwrap();

    let err = orchestrator.get_task_status(&task_id).await.unwrap_err();
    assert!(matches!(err, AuditError::TaskNotFound { .. }));
    assert!(orchestrator.list_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_an_unknown_task_is_an_error() {
    let store = Arc::new(MemoryTaskStore::new());
    let pricing = Arc::new(ScriptedPricing::new(vec![]));
    let orchestrator = AuditOrchestrator::new(store, pricing, quick_config());

    let err = orchestrator
        .cancel_and_delete_task(&TaskId::from_string("task_ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::TaskNotFound { .. }));
}
