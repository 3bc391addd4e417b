//! Hapfile parsing and host resolution for hap.
//!
//! This crate handles:
//! - The section/key lexer shared by Hapfiles and `.gitmodules`
//! - Decoding a single Hapfile into hosts, builds and deploys
//! - Merging includes into a resolved, read-only [`ConfigGraph`]

pub mod error;
pub mod graph;
pub mod hapfile;
pub mod ini;

pub use error::{ConfigError, ConfigResult};
pub use graph::{ConfigGraph, ResolvedDeploy};
pub use hapfile::{Hapfile, parse_hapfile};
pub use ini::{Entry, Section, parse_sections};
