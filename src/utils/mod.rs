// Utilities: run metrics, event tracing and CSV export.
pub mod metrics;
pub mod export;
