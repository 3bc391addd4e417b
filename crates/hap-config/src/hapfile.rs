//! Hapfile decoding.
//!
//! Turns the sections of one file into hosts, builds and deploys. Nothing is
//! resolved here: defaults, includes and build flattening happen in
//! [`crate::ConfigGraph`].

use hap_core::{Build, Deploy, Host};
use std::collections::BTreeMap;

use crate::ini::{Section, parse_sections};
use crate::{ConfigError, ConfigResult};

/// The declarations of a single Hapfile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hapfile {
    pub default: Host,
    pub hosts: BTreeMap<String, Host>,
    pub builds: BTreeMap<String, Build>,
    pub deploys: BTreeMap<String, Deploy>,
    /// `[include] path` entries, in declared order.
    pub includes: Vec<String>,
    /// `[env] file` entries, in declared order.
    pub env: Vec<String>,
}

const HOST_KEYS: &[&str] = &[
    "addr", "username", "identity", "password", "dir", "build", "cmd", "env",
];
const BUILD_KEYS: &[&str] = &["cmd"];
const DEPLOY_KEYS: &[&str] = &["host", "build", "cmd", "env"];
const INCLUDE_KEYS: &[&str] = &["path"];
const ENV_KEYS: &[&str] = &["file"];

/// Parse a Hapfile from text.
pub fn parse_hapfile(text: &str) -> ConfigResult<Hapfile> {
    let mut hapfile = Hapfile::default();

    for section in parse_sections(text)? {
        match section.kind.as_str() {
            "default" => {
                check_keys(&section, HOST_KEYS)?;
                no_name(&section)?;
                hapfile.default.name = "default".to_string();
                apply_host(&mut hapfile.default, &section);
            }
            "host" => {
                check_keys(&section, HOST_KEYS)?;
                let name = require_name(&section)?;
                let host = hapfile
                    .hosts
                    .entry(name.clone())
                    .or_insert_with(|| Host::new(name));
                apply_host(host, &section);
            }
            "build" => {
                check_keys(&section, BUILD_KEYS)?;
                let name = require_name(&section)?;
                let build = hapfile
                    .builds
                    .entry(name.clone())
                    .or_insert_with(|| Build {
                        name,
                        cmd: Vec::new(),
                    });
                build.cmd.extend(strings(&section, "cmd"));
            }
            "deploy" => {
                check_keys(&section, DEPLOY_KEYS)?;
                let name = require_name(&section)?;
                let deploy = hapfile
                    .deploys
                    .entry(name.clone())
                    .or_insert_with(|| Deploy {
                        name,
                        ..Default::default()
                    });
                let hosts = strings(&section, "host");
                deploy.union_hosts(&hosts);
                deploy.build.extend(strings(&section, "build"));
                deploy.cmd.extend(strings(&section, "cmd"));
                deploy.env.extend(strings(&section, "env"));
            }
            "include" => {
                check_keys(&section, INCLUDE_KEYS)?;
                no_name(&section)?;
                hapfile.includes.extend(strings(&section, "path"));
            }
            "env" => {
                check_keys(&section, ENV_KEYS)?;
                no_name(&section)?;
                hapfile.env.extend(strings(&section, "file"));
            }
            _ => return Err(ConfigError::UnknownSection(section.label())),
        }
    }

    Ok(hapfile)
}

fn apply_host(host: &mut Host, section: &Section) {
    set_last(&mut host.addr, section, "addr");
    set_last(&mut host.username, section, "username");
    set_last(&mut host.identity, section, "identity");
    set_last(&mut host.password, section, "password");
    set_last(&mut host.dir, section, "dir");
    host.build.extend(strings(section, "build"));
    host.cmd.extend(strings(section, "cmd"));
    host.env.extend(strings(section, "env"));
}

fn set_last(field: &mut String, section: &Section, key: &str) {
    if let Some(value) = section.last(key) {
        *field = value.to_string();
    }
}

fn strings(section: &Section, key: &str) -> Vec<String> {
    section.values(key).map(str::to_string).collect()
}

fn check_keys(section: &Section, allowed: &[&str]) -> ConfigResult<()> {
    match section
        .entries
        .iter()
        .find(|e| !allowed.contains(&e.key.as_str()))
    {
        Some(entry) => Err(ConfigError::UnknownKey {
            section: section.label(),
            key: entry.key.clone(),
        }),
        None => Ok(()),
    }
}

fn require_name(section: &Section) -> ConfigResult<String> {
    match &section.name {
        Some(name) if !name.is_empty() => Ok(name.clone()),
        _ => Err(ConfigError::MissingField(format!(
            "{} name on line {}",
            section.kind, section.line
        ))),
    }
}

fn no_name(section: &Section) -> ConfigResult<()> {
    if section.name.is_some() {
        return Err(ConfigError::InvalidValue {
            field: section.kind.clone(),
            message: format!("[{}] does not take a name", section.kind),
        });
    }
    Ok(())
}
