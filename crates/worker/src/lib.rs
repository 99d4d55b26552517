//! RPA worker: accepts batch handoffs and runs their jobs on one
//! authenticated browser session per batch.

pub mod automation;
pub mod config;
pub mod credentials;
pub mod error;
pub mod portal;
pub mod processor;
pub mod router;
pub mod routes;
pub mod state;

pub use automation::{ProviderAutomation, ProviderRegistry};
pub use config::WorkerConfig;
pub use credentials::{CredentialStore, Credentials};
pub use error::{AutomationError, ProcessorError};
pub use processor::{BatchProcessor, ProcessorConfig};
pub use state::AppState;
