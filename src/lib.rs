//! Asynchronous material price-audit pipeline.
//!
//! Line items submitted as a task are deduplicated, dispatched to an
//! external pricing-recommendation service under bounded concurrency with
//! retry and backoff, scored against the recommended price range, and
//! fanned back out so every submitted row ends up with exactly one result.
//! Tasks can be polled for progress, cancelled mid-run, and deleted.

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod services;
pub mod traits;
pub mod types;

pub use config::{OrchestratorConfig, PricingConfig, RetryPolicy};
pub use error::{AuditError, PipelineResult};
pub use orchestrator::AuditOrchestrator;
pub use services::{HttpPricingClient, MemoryTaskStore};
pub use traits::{PricingApi, TaskStore};
pub use types::{
    AuditOutcome, FilterParams, ItemStatus, LineItem, MaterialId, Task, TaskId, TaskProgress,
    TaskStatus,
};
