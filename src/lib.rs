//! Workload execution engine for benchmark fleets.
//!
//! A [`workload::Workload`] describes what to install, run and parse; the
//! [`engine::WorkloadEngine`] drives it through its lifecycle, synchronizes
//! client flows with server peers, and reports a [`lifecycle::RunReport`].

pub mod api;
pub mod cancel;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod metrics;
pub mod packages;
pub mod process;
pub mod profiling;
pub mod retry;
pub mod state;
pub mod sync;
pub mod workload;
pub mod workloads;

pub use engine::{EngineBuilder, WorkloadEngine};
pub use error::{Error, Result};
