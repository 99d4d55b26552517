//! Background loops run by the orchestrator binary.
//!
//! Each submodule provides a long-running async function intended to be
//! spawned via `tokio::spawn`. All loops accept a [`CancellationToken`]
//! for graceful shutdown and only talk to each other through the store.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod dispatch;
pub mod recovery;
pub mod store_purge;
