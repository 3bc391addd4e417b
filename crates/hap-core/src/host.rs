//! Host, build and deploy records.
//!
//! A [`Host`] carries both what the Hapfile declared for it and the command
//! list derived from its build groups. The derived list is private and only
//! changes through [`Host::flatten`] or [`Host::with_overlay`].

use serde::Serialize;
use std::collections::BTreeMap;

/// A remote machine to provision.
///
/// The `[default]` section has the same shape and is represented by a `Host`
/// as well.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Host {
    /// Unique key from `[host "name"]`.
    pub name: String,
    /// Network address, `host` or `host:port`.
    pub addr: String,
    pub username: String,
    /// Path to a private key file.
    pub identity: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Remote working directory, relative to the remote home.
    pub dir: String,
    /// Build group references, in declared order.
    pub build: Vec<String>,
    /// Ad-hoc commands, in declared order.
    pub cmd: Vec<String>,
    /// Shell-sourceable environment files, in sourcing order.
    pub env: Vec<String>,
    /// Build group commands followed by `cmd`.
    commands: Vec<String>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Fill every empty field from the defaults.
    ///
    /// A field that is already set is never touched.
    pub fn apply_defaults(&mut self, defaults: &Host) {
        fill(&mut self.addr, &defaults.addr);
        fill(&mut self.username, &defaults.username);
        fill(&mut self.identity, &defaults.identity);
        fill(&mut self.password, &defaults.password);
        fill(&mut self.dir, &defaults.dir);
        fill_list(&mut self.build, &defaults.build);
        fill_list(&mut self.cmd, &defaults.cmd);
        fill_list(&mut self.env, &defaults.env);
    }

    /// Rebuild the resolved command list from the build table.
    ///
    /// References to unknown build groups contribute nothing.
    pub fn flatten(&mut self, builds: &BTreeMap<String, Build>) {
        self.commands = self
            .build
            .iter()
            .filter_map(|name| builds.get(name))
            .flat_map(|b| b.cmd.iter().cloned())
            .chain(self.cmd.iter().cloned())
            .collect();
    }

    /// The resolved command list.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Clone this host with build, cmd and env taken from a deploy.
    ///
    /// Name, address, directory and credentials are inherited unchanged.
    /// `global_env` is prepended to the deploy's own env files.
    pub fn with_overlay(
        &self,
        deploy: &Deploy,
        builds: &BTreeMap<String, Build>,
        global_env: &[String],
    ) -> Host {
        let mut host = Host {
            build: deploy.build.clone(),
            cmd: deploy.cmd.clone(),
            env: global_env
                .iter()
                .chain(deploy.env.iter())
                .cloned()
                .collect(),
            commands: Vec::new(),
            ..self.clone()
        };
        host.flatten(builds);
        host
    }
}

fn fill(field: &mut String, fallback: &str) {
    if field.is_empty() {
        *field = fallback.to_string();
    }
}

fn fill_list(field: &mut Vec<String>, fallback: &[String]) {
    if field.is_empty() {
        *field = fallback.to_vec();
    }
}

/// A named, ordered list of shell commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Build {
    pub name: String,
    pub cmd: Vec<String>,
}

/// A named group of hosts sharing a build/cmd/env overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Deploy {
    pub name: String,
    /// Host references, in declared order and without duplicates.
    pub hosts: Vec<String>,
    pub build: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
}

impl Deploy {
    /// Add host references not already present.
    pub fn union_hosts<'a>(&mut self, hosts: impl IntoIterator<Item = &'a String>) {
        for host in hosts {
            if !self.hosts.contains(host) {
                self.hosts.push(host.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builds() -> BTreeMap<String, Build> {
        let mut builds = BTreeMap::new();
        builds.insert(
            "deps".to_string(),
            Build {
                name: "deps".to_string(),
                cmd: vec!["apt-get update".to_string(), "apt-get install -y git".to_string()],
            },
        );
        builds.insert(
            "app".to_string(),
            Build {
                name: "app".to_string(),
                cmd: vec!["make".to_string()],
            },
        );
        builds
    }

    #[test]
    fn test_defaults_fill_only_empty_fields() {
        let mut host = Host::new("web");
        host.addr = "10.0.0.2:22".to_string();
        host.username = "deploy".to_string();

        let mut defaults = Host::new("default");
        defaults.addr = "10.0.0.1:22".to_string();
        defaults.username = "root".to_string();
        defaults.identity = "~/.ssh/id_ed25519".to_string();
        defaults.build = vec!["deps".to_string()];

        host.apply_defaults(&defaults);

        assert_eq!(host.addr, "10.0.0.2:22");
        assert_eq!(host.username, "deploy");
        assert_eq!(host.identity, "~/.ssh/id_ed25519");
        assert_eq!(host.build, vec!["deps"]);
        assert_eq!(host.name, "web");
    }

    #[test]
    fn test_flatten_orders_builds_then_cmds() {
        let mut host = Host::new("web");
        host.build = vec!["app".to_string(), "missing".to_string(), "deps".to_string()];
        host.cmd = vec!["echo done".to_string()];
        host.flatten(&builds());

        assert_eq!(
            host.commands(),
            &["make", "apt-get update", "apt-get install -y git", "echo done"]
        );
    }

    #[test]
    fn test_flatten_rebuilds_from_scratch() {
        let mut host = Host::new("web");
        host.build = vec!["app".to_string()];
        host.flatten(&builds());
        host.build = vec!["deps".to_string()];
        host.flatten(&builds());

        assert_eq!(host.commands(), &["apt-get update", "apt-get install -y git"]);
    }

    #[test]
    fn test_overlay_keeps_identity_fields() {
        let mut host = Host::new("web");
        host.addr = "10.0.0.2:2222".to_string();
        host.username = "deploy".to_string();
        host.identity = "~/.ssh/web".to_string();
        host.password = "secret".to_string();
        host.dir = "site".to_string();
        host.build = vec!["deps".to_string()];
        host.cmd = vec!["echo host".to_string()];
        host.env = vec!["host.env".to_string()];
        host.flatten(&builds());

        let deploy = Deploy {
            name: "release".to_string(),
            hosts: vec!["web".to_string()],
            build: vec!["app".to_string()],
            cmd: vec!["echo deploy".to_string()],
            env: vec!["deploy.env".to_string()],
        };
        let view = host.with_overlay(&deploy, &builds(), &["global.env".to_string()]);

        assert_eq!(view.name, host.name);
        assert_eq!(view.addr, host.addr);
        assert_eq!(view.identity, host.identity);
        assert_eq!(view.password, host.password);
        assert_eq!(view.dir, host.dir);
        assert_eq!(view.build, vec!["app"]);
        assert_eq!(view.env, vec!["global.env", "deploy.env"]);
        assert_eq!(view.commands(), &["make", "echo deploy"]);

        // The base host is untouched.
        assert_eq!(host.commands(), &["apt-get update", "apt-get install -y git", "echo host"]);
    }

    #[test]
    fn test_union_hosts_skips_duplicates() {
        let mut deploy = Deploy::default();
        deploy.union_hosts(&["a".to_string(), "b".to_string()]);
        deploy.union_hosts(&["b".to_string(), "c".to_string()]);
        assert_eq!(deploy.hosts, vec!["a", "b", "c"]);
    }
}
