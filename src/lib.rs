//! hostwatch - a host and container telemetry agent.
//!
//! Providers sample one metric domain each on their own cadence. The merged
//! latest samples are published as snapshots, persisted to a time-series
//! backend with a local fallback log, evaluated against alert rules and
//! pushed to live consumers.

pub mod alerts;
pub mod app;
pub mod cli;
pub mod codec;
pub mod config;
pub mod console;
pub mod core;
pub mod fanout;
pub mod history;
pub mod internal_metrics;
pub mod persistence;
pub mod providers;
pub mod publisher;
pub mod registry;
pub mod reload;
pub mod scheduler;
pub mod task_manager;
pub mod web;

pub use crate::core::*;
