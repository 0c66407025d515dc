//! Service-specific tests

mod task_store;
