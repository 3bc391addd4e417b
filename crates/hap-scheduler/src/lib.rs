//! Fleet scheduling for hap.
//!
//! Runs one job on every selected host at once and collects a report per
//! host. A failing host never stops the others.

pub mod orchestrator;

pub use orchestrator::{
    FleetEvent, FleetOrchestrator, FleetResult, HostContext, HostJob, HostReport, HostState,
    JobFailure,
};
