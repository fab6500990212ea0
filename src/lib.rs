//! Sector-sweep pressure-pad controller.
//!
//! Two execution contexts share state through `component_a::sync_manager`:
//! - component A (acquisition): servo sweep, distance fusion, sector minimums, telemetry
//! - component B (control): setpoints, per-channel safety machine and PI, pad drivers

pub mod command;
pub mod component_a;
pub mod component_b;
pub mod config;
pub mod error;
pub mod utils;
