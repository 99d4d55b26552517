//! Typed access to coordination records.
//!
//! Repositories are unit structs with associated `async fn`s taking the
//! store as their first argument.

pub mod batch_repo;
pub mod job_marker_repo;
pub mod totp_repo;
pub mod unit_repo;

pub use batch_repo::BatchRepo;
pub use job_marker_repo::{JobMarker, JobMarkerRepo, MarkerClaim};
pub use totp_repo::TotpRepo;
pub use unit_repo::UnitRepo;
