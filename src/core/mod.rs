//! Pure pipeline logic: dedup grouping and price scoring

pub mod aggregate;
pub mod dedup;

pub use dedup::DedupPlan;
