//! The resolved configuration graph.
//!
//! Loading merges the root Hapfile with every file named in its `[include]`
//! section, then resolves each host once: defaults applied, build groups
//! flattened and environment files ordered. The graph is read-only after
//! construction and can be shared between host tasks.
//!
//! Merge rules:
//! - hosts, builds and deploys already present keep their first definition
//! - deploy host references are unioned across files
//! - `[default]` fields are filled from includes only where still empty
//! - `[env]` files are sourced includes first (in include order), then the
//!   root file's, then the host's or deploy's own

use glob::Pattern;
use hap_core::{Build, Deploy, Host};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::hapfile::{Hapfile, parse_hapfile};
use crate::{ConfigError, ConfigResult};

/// A deploy together with its per-host views.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedDeploy {
    pub deploy: Deploy,
    pub hosts: BTreeMap<String, Host>,
}

/// Hosts, builds and deploys resolved from a Hapfile and its includes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigGraph {
    #[serde(skip)]
    default: Host,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_host: Option<Host>,
    hosts: BTreeMap<String, Host>,
    builds: BTreeMap<String, Build>,
    deploys: BTreeMap<String, ResolvedDeploy>,
    env: Vec<String>,
}

impl ConfigGraph {
    /// Load a Hapfile and its includes.
    ///
    /// The root file must be readable. An include that does not exist is
    /// skipped with a warning; an include that exists but does not parse is
    /// an error.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let root = read_hapfile(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut includes = Vec::new();
        for include in &root.includes {
            let include_path = resolve_include(base_dir, include);
            match std::fs::read_to_string(&include_path) {
                Ok(text) => {
                    let hapfile =
                        parse_hapfile(&text).map_err(|e| e.in_file(include_path.clone()))?;
                    debug!(path = %include_path.display(), "Loaded include");
                    includes.push(hapfile);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %include_path.display(), "Include not found, skipping");
                }
                Err(source) => {
                    return Err(ConfigError::Read {
                        path: include_path,
                        source,
                    });
                }
            }
        }

        let graph = Self::from_hapfiles(root, includes);
        info!(
            path = %path.display(),
            hosts = graph.hosts.len(),
            deploys = graph.deploys.len(),
            "Hapfile loaded"
        );
        Ok(graph)
    }

    /// Merge already parsed files and resolve them.
    ///
    /// `includes` are merged in order; includes declared inside them are not
    /// followed.
    pub fn from_hapfiles(root: Hapfile, includes: Vec<Hapfile>) -> Self {
        let mut merged = root;
        let root_env = std::mem::take(&mut merged.env);
        let mut env = Vec::new();

        for include in includes {
            if !include.includes.is_empty() {
                debug!(
                    paths = ?include.includes,
                    "Ignoring includes declared in an included file"
                );
            }
            env.extend(include.env.iter().cloned());
            merge(&mut merged, include);
        }
        env.extend(root_env);

        Self::resolve(merged, env)
    }

    fn resolve(hapfile: Hapfile, env: Vec<String>) -> Self {
        let Hapfile {
            default,
            hosts,
            builds,
            deploys,
            ..
        } = hapfile;

        let hosts: BTreeMap<String, Host> = hosts
            .into_iter()
            .map(|(name, mut host)| {
                host.name = name.clone();
                host.apply_defaults(&default);
                host.env = prefixed(&env, &host.env);
                host.flatten(&builds);
                (name, host)
            })
            .collect();

        let default_host = if default.addr.is_empty() {
            None
        } else {
            let mut host = default.clone();
            host.name = "default".to_string();
            host.env = prefixed(&env, &host.env);
            host.flatten(&builds);
            Some(host)
        };

        let deploys = deploys
            .into_iter()
            .map(|(name, deploy)| {
                let mut views = BTreeMap::new();
                for host_name in &deploy.hosts {
                    match hosts.get(host_name) {
                        Some(base) => {
                            views.insert(
                                host_name.clone(),
                                base.with_overlay(&deploy, &builds, &env),
                            );
                        }
                        None => {
                            warn!(deploy = %name, host = %host_name, "Deploy references unknown host");
                        }
                    }
                }
                (
                    name,
                    ResolvedDeploy {
                        deploy,
                        hosts: views,
                    },
                )
            })
            .collect();

        Self {
            default,
            default_host,
            hosts,
            builds,
            deploys,
            env,
        }
    }

    /// Look up a resolved host.
    ///
    /// Unknown names fall back to a host named `default` built from the
    /// `[default]` section when it has an address.
    pub fn host(&self, name: &str) -> Option<Host> {
        self.hosts
            .get(name)
            .or(self.default_host.as_ref())
            .cloned()
    }

    /// All declared hosts, resolved.
    pub fn hosts(&self) -> &BTreeMap<String, Host> {
        &self.hosts
    }

    /// The `[default]` section as declared.
    pub fn defaults(&self) -> &Host {
        &self.default
    }

    pub fn builds(&self) -> &BTreeMap<String, Build> {
        &self.builds
    }

    /// Environment files applied to every host, in sourcing order.
    pub fn global_env(&self) -> &[String] {
        &self.env
    }

    /// Select hosts whose names match a shell glob.
    ///
    /// A plain name that matches nothing falls back to [`ConfigGraph::host`].
    pub fn select_hosts(&self, pattern: &str) -> ConfigResult<BTreeMap<String, Host>> {
        let mut selected = select(&self.hosts, pattern)?;
        if selected.is_empty() && !is_glob(pattern) {
            if let Some(host) = self.host(pattern) {
                selected.insert(host.name.clone(), host);
            }
        }
        Ok(selected)
    }

    /// A host as seen through a deploy.
    ///
    /// Errors when the deploy does not exist; `None` when the deploy exists
    /// but does not include the host.
    pub fn deploy_host(&self, deploy: &str, host: &str) -> ConfigResult<Option<Host>> {
        Ok(self.resolved_deploy(deploy)?.hosts.get(host).cloned())
    }

    /// Select deploy host views whose names match a shell glob.
    pub fn select_deploy_hosts(
        &self,
        deploy: &str,
        pattern: &str,
    ) -> ConfigResult<BTreeMap<String, Host>> {
        select(&self.resolved_deploy(deploy)?.hosts, pattern)
    }

    fn resolved_deploy(&self, name: &str) -> ConfigResult<&ResolvedDeploy> {
        self.deploys
            .get(name)
            .ok_or_else(|| ConfigError::DeployNotFound(name.to_string()))
    }
}

fn read_hapfile(path: &Path) -> ConfigResult<Hapfile> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_hapfile(&text).map_err(|e| e.in_file(path))
}

fn resolve_include(base_dir: &Path, include: &str) -> PathBuf {
    let include = Path::new(include);
    if include.is_absolute() {
        include.to_path_buf()
    } else {
        base_dir.join(include)
    }
}

/// Merge an included file into the accumulated one. Existing entries win.
fn merge(base: &mut Hapfile, include: Hapfile) {
    base.default.apply_defaults(&include.default);

    for (name, host) in include.hosts {
        base.hosts.entry(name).or_insert(host);
    }
    for (name, build) in include.builds {
        base.builds.entry(name).or_insert(build);
    }
    for (name, deploy) in include.deploys {
        match base.deploys.get_mut(&name) {
            Some(existing) => existing.union_hosts(&deploy.hosts),
            None => {
                base.deploys.insert(name, deploy);
            }
        }
    }
}

fn prefixed(global: &[String], local: &[String]) -> Vec<String> {
    global.iter().chain(local.iter()).cloned().collect()
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn select(hosts: &BTreeMap<String, Host>, pattern: &str) -> ConfigResult<BTreeMap<String, Host>> {
    let matcher = Pattern::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;
    Ok(hosts
        .iter()
        .filter(|(name, _)| matcher.matches(name))
        .map(|(name, host)| (name.clone(), host.clone()))
        .collect())
}
