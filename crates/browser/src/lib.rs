//! Ephemeral browser-automation execution units.
//!
//! [`manager::ExecutionUnitManager`] drives the unit lifecycle through the
//! shared store; [`api::ExecutionUnitApi`] is the control plane that actually
//! starts and stops units; [`reaper::UnitReaper`] runs the periodic
//! reclamation and warm-pool checks.

pub mod api;
pub mod error;
pub mod manager;
pub mod reaper;
pub mod session;

pub use api::{ExecutionUnitApi, HttpExecutionUnitApi, ProvisionRequest, ProvisionedUnit, Readiness};
pub use error::ExecutionUnitError;
pub use manager::{AcquiredUnit, ExecutionUnitManager, ShutdownSummary, UnitManagerConfig};
pub use reaper::{ReapSummary, UnitReaper};
pub use session::AutomationSession;
