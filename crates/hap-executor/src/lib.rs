//! Remote execution for hap.
//!
//! Provides:
//! - [`SshTransport`], which opens one OpenSSH control-master session per host
//! - [`CommandRunner`], which turns a command list into a single fail-fast
//!   shell invocation with the host identity exported

pub mod runner;
pub mod ssh;

pub use runner::{CommandRunner, host_env, shell_quote};
pub use ssh::{AuthPlan, SshSession, SshTransport, split_addr};
