//! Transport and session traits.
//!
//! A transport opens one authenticated remote-shell session per host. Sessions
//! are never shared between hosts.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::{Host, HostOutput, Result};

/// A kind of credential offered while authenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AuthKind {
    /// Keys offered by a running ssh-agent.
    Agent,
    /// The identity file configured for the host.
    Identity,
    /// Conventional key paths under `~/.ssh`, used when no identity is set.
    DefaultKeys,
    /// The configured password.
    Password,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::Agent => "agent",
            AuthKind::Identity => "identity",
            AuthKind::DefaultKeys => "default keys",
            AuthKind::Password => "password",
        }
    }

    /// Comma separated list, or `none` when empty.
    pub fn join(kinds: &[AuthKind]) -> String {
        if kinds.is_empty() {
            return "none".to_string();
        }
        kinds
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a remote command ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteExit {
    /// Exit code, `None` when the remote process was killed by a signal.
    pub code: Option<i32>,
    /// Everything the remote wrote to stderr.
    pub stderr: String,
}

impl RemoteExit {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            stderr: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Trait for opening sessions to hosts.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish one authenticated session to the host.
    async fn open(&self, host: &Host) -> Result<Box<dyn Session>>;
}

/// An authenticated remote shell bound to a single host.
#[async_trait]
pub trait Session: Send + Sync {
    /// The host this session is bound to.
    fn host(&self) -> &Host;

    /// Run one shell command line, streaming stdout and stderr through the
    /// host output, and wait for it to exit.
    async fn run(&self, command: &str, output: &HostOutput) -> Result<RemoteExit>;

    /// A local command line that reaches the host over this session, for use
    /// as `GIT_SSH_COMMAND`. `None` when the session cannot be reused by
    /// other programs.
    fn ssh_command(&self) -> Option<String> {
        None
    }

    /// Close the session. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}
