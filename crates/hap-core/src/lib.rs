//! Core domain types and traits for hap.
//!
//! This crate contains:
//! - Host, build and deploy records resolved from a Hapfile
//! - Transport and session traits for reaching remote hosts
//! - The host-tagged output sink shared by every concurrent host task
//! - The error taxonomy used across the workspace

pub mod error;
pub mod host;
pub mod output;
pub mod transport;

pub use error::{Error, HostFailure, Result};
pub use host::{Build, Deploy, Host};
pub use output::{HostOutput, HostWriter, LineSink};
pub use transport::{AuthKind, RemoteExit, Session, Transport};
