//! Domain types and pure coordination logic.
//!
//! This crate has zero internal deps so the orchestrator, the worker and
//! the store backends can all share one definition of batches, TOTP
//! reservations and execution units.

pub mod backoff;
pub mod batch;
pub mod clock;
pub mod config;
pub mod error;
pub mod execution_unit;
pub mod job;
pub mod totp;
pub mod types;
pub mod wire;
pub mod worker_pool;
