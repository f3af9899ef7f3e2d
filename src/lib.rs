//! Bot Population Server Library
//!
//! Spawn control plane that keeps a simulated player population in a live
//! game world, paced against host resources.
//!
//! # Features
//!
//! - `host_sampler` - Process CPU/memory sampling through sysinfo (enabled by default)
//! - `metrics_server` - Prometheus/JSON endpoint in the demo binary (enabled by default)
//! - `minimal` - Build without optional features for testing/debugging

pub mod adapter;
pub mod commands;
pub mod config;
pub mod control;
pub mod metrics;
pub mod performance;
pub mod population;
pub mod sim;
pub mod spawn;
pub mod util;
pub mod world;
