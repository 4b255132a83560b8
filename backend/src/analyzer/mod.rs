// =============================================================================
// Analytics — per-symbol multi-timeframe state and the pure math behind it
// =============================================================================

pub mod chart;
pub mod controller;
pub mod divergence;
pub mod price_levels;
pub mod series;

pub use controller::{AnalyticsParams, Controller, ControllerSnapshot, PatternUpdate, RecomputeJob, Recomputed, TickOutcome};
