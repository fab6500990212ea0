// Component A: acquisition context
// Sweeps the scan servo, fuses the distance sensors into per-sector minimums,
// publishes them through the shared-state layer and emits telemetry frames.

pub mod sensor;
pub mod sweep;
pub mod sync_manager;
pub mod telemetry;
pub mod transmitter;
