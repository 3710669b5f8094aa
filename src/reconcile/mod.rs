//! Host scheduler integration and drift repair.

pub mod host;
pub mod manager;

pub use host::{
    AuthorizationStatus, CancelOutcome, FireEvent, HostEntry, HostEntryState, HostError, HostScheduler,
    LocalHostScheduler,
};
pub use manager::{host_config, ReconcileError, ReconcileReport, ReconciliationManager, ReschedulePlan};
