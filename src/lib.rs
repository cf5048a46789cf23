//! # variant-weight-optimizer
//!
//! An online Thompson-Sampling optimizer for feature-flag experiment
//! variants. Watches exposure/conversion counters for each variant of each
//! experiment, periodically recomputes posterior-driven traffic weights,
//! and serves datafiles with those weights overlaid for client SDKs to
//! fetch.
//!
//! ## Architecture
//!
//! - [`counter_store`] — durable, concurrently-updated exposure/conversion
//!   counters (Redis-backed)
//! - [`datafile`] — loads and indexes the platform's datafiles
//! - [`overlay`] — pure rewrite of a datafile's variant weights
//! - [`sampler`] — Thompson Sampling over Beta posteriors
//! - [`scheduler`] — periodic recalculation of weights across all groups
//! - [`server`] — REST surface for event ingest and queries

pub mod config;
pub mod counter_store;
pub mod datafile;
pub mod error;
pub mod overlay;
pub mod sampler;
pub mod scheduler;
pub mod server;
pub mod types;

pub use config::Config;
pub use counter_store::{CounterStore, RedisCounterStore};
pub use datafile::{Datafile, DatafileRepository, VariantRef};
pub use error::{OptimizerError, Result};
pub use scheduler::Scheduler;
pub use server::run_server;
pub use types::{CounterSnapshot, CycleSummary, EventPayload, GroupKey, StatsEntry, VariantKey};
