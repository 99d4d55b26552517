//! Orchestrator side of the RPA coordination layer.
//!
//! Assembles pending jobs into batches, reserves TOTP codes for them, hands
//! each batch to exactly one worker and recovers batches whose worker went
//! silent. All coordination state lives in the shared [`rpa_store::StateStore`].

pub mod assembler;
pub mod background;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod totp;
pub mod transport;

pub use assembler::BatchAssembler;
pub use config::OrchestratorConfig;
pub use dispatcher::{BatchDispatcher, DispatchOutcome, DispatcherConfig};
pub use error::{DispatchError, TotpError, TransportError};
pub use monitor::{HeartbeatMonitor, Recovery};
pub use totp::{ReservedCode, TotpCoordinator};
pub use transport::{HttpWorkerTransport, WorkerTransport};
