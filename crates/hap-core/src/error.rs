//! Error types for hap.

use std::fmt;

use thiserror::Error;

use crate::transport::AuthKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to {addr} (tried {}): {message}", AuthKind::join(.attempted))]
    Connect {
        addr: String,
        attempted: Vec<AuthKind>,
        message: String,
    },

    #[error("git {action} failed: {output}")]
    Git { action: String, output: String },

    #[error("submodule push failed: {}", join_failures(.0))]
    Submodules(Vec<HostFailure>),

    #[error("remote command exited with {}: {stderr}", exit_label(.code))]
    Exec { code: Option<i32>, stderr: String },

    #[error("already completed")]
    AlreadyCompleted,

    #[error("{} host(s) failed: {}", .0.len(), join_failures(.0))]
    PartialFleet(Vec<HostFailure>),

    #[error("no session open for {0}")]
    NoSession(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Exit code of a failed remote command, if the remote reported one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::Exec { code, .. } => *code,
            _ => None,
        }
    }
}

/// One named failure inside an aggregate error.
///
/// The name is a host name for fleet runs and a submodule path for
/// submodule pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFailure {
    pub name: String,
    pub message: String,
}

impl HostFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.name, self.message)
    }
}

fn join_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (killed by signal)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
