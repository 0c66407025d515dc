//! Audit pipeline error types

use thiserror::Error;

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, AuditError>;

/// Audit pipeline error taxonomy
#[derive(Error, Debug)]
pub enum AuditError {
    /// Missing or unusable pricing-service credentials. Fatal, never retried.
    #[error("pricing service configuration missing: {field}")]
    Config { field: String },

    /// Pricing service failure after retry exhaustion
    #[error("pricing service failed after {attempts} attempts: {message}")]
    Upstream { attempts: u32, message: String },

    /// Persistence failure in the task store
    #[error("task store {operation} failed: {message}")]
    Store { operation: String, message: String },

    /// Task lookup miss after bounded retries
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Task exists but carries no persisted materials
    #[error("task {task_id} has no persisted materials")]
    EmptyMaterialSet { task_id: String },

    /// In-flight call aborted through its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
