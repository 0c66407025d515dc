//! Service implementations
//!
//! Real implementations of the pipeline's collaborator seams, plus the
//! cancellation registry shared by the orchestrator and the client.

pub mod pricing_client;
pub mod registry;
pub mod task_store;

#[cfg(test)]
mod tests;

pub use pricing_client::HttpPricingClient;
pub use registry::{CancelRegistry, CancelToken};
pub use task_store::MemoryTaskStore;
