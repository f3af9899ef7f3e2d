//! Per-zone population accounting

pub mod manager;

pub use manager::{PopulationManager, ZoneInfo, ZonePopulation};
