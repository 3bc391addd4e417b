//! Configuration errors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("unknown section [{0}]")]
    UnknownSection(String),

    #[error("unknown key '{key}' in [{section}]")]
    UnknownKey { section: String, key: String },

    #[error("deploy not found: {0}")]
    DeployNotFound(String),

    #[error("invalid host pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: {source}", .path.display())]
    InFile {
        path: PathBuf,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    /// Attach the file a parse error came from.
    pub fn in_file(self, path: impl Into<PathBuf>) -> Self {
        ConfigError::InFile {
            path: path.into(),
            source: Box::new(self),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
