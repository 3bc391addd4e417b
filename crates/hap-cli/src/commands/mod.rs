//! CLI command implementations.

pub mod build;
pub mod create;
pub mod exec;
pub mod hosts;
pub mod init;
pub mod push;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use hap_config::ConfigGraph;
use hap_core::{Host, LineSink};
use hap_deployer::{GitDeployer, Remote};
use hap_executor::SshTransport;
use hap_scheduler::{FleetOrchestrator, HostContext, HostJob, JobFailure};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Which hosts a command runs on.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub host: Option<String>,
    pub all: bool,
}

/// A command that runs on every selected host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init,
    Push,
    Build { force: bool },
    Deploy { name: String },
    Exec { script: String },
    Arbitrary { command: String },
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Init => "init",
            Command::Push => "push",
            Command::Build { .. } => "build",
            Command::Deploy { .. } => "deploy",
            Command::Exec { .. } => "exec",
            Command::Arbitrary { .. } => "c",
        }
    }

    fn deploy_name(&self) -> Option<&str> {
        match self {
            Command::Deploy { name } => Some(name),
            _ => None,
        }
    }
}

/// Runs a [`Command`] on one host.
pub struct CommandJob {
    command: Command,
    deployer: GitDeployer,
}

impl CommandJob {
    pub fn new(command: Command, deployer: GitDeployer) -> Self {
        Self { command, deployer }
    }
}

#[async_trait]
impl HostJob for CommandJob {
    fn name(&self) -> &str {
        self.command.verb()
    }

    async fn run(&self, ctx: &HostContext<'_>) -> std::result::Result<String, JobFailure> {
        let remote = Remote {
            host: ctx.host.clone(),
            session: ctx.session()?,
            output: ctx.output.clone(),
        };
        match &self.command {
            Command::Init => init::run(&self.deployer, &remote).await,
            Command::Push => push::run(&self.deployer, &remote).await,
            Command::Build { force } => build::run(&self.deployer, &remote, *force).await,
            Command::Deploy { .. } => build::deploy(&self.deployer, &remote).await,
            Command::Exec { script } => exec::script(&self.deployer, &remote, script).await,
            Command::Arbitrary { command } => exec::arbitrary(&remote, command).await,
        }
    }
}

pub fn load_graph(path: &Path) -> Result<ConfigGraph> {
    ConfigGraph::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Resolve the hosts a command runs on.
///
/// Deploys run on all of their hosts unless `--host` narrows them. Other
/// commands need `--host` or `--all`, falling back to the default host and
/// then to the only declared host.
pub fn select_hosts(
    graph: &ConfigGraph,
    selection: &Selection,
    deploy: Option<&str>,
) -> Result<BTreeMap<String, Host>> {
    let pattern = selection.host.as_deref();

    let hosts = match (deploy, pattern) {
        (Some(deploy), pattern) => {
            let pattern = if selection.all { "*" } else { pattern.unwrap_or("*") };
            graph.select_deploy_hosts(deploy, pattern)?
        }
        (None, _) if selection.all => graph.select_hosts("*")?,
        (None, Some(pattern)) => graph.select_hosts(pattern)?,
        (None, None) => {
            if !graph.defaults().addr.is_empty() {
                graph
                    .host("default")
                    .map(|host| BTreeMap::from([(host.name.clone(), host)]))
                    .unwrap_or_default()
            } else if graph.hosts().len() == 1 {
                graph.hosts().clone()
            } else {
                bail!("No host. Use --all or --host");
            }
        }
    };

    if hosts.is_empty() {
        bail!(
            "No host matches `{}`",
            pattern.unwrap_or(if selection.all { "*" } else { "default" })
        );
    }
    Ok(hosts)
}

/// Run a command on the selected hosts. Fails with the per-host failures
/// when any host failed.
pub async fn run_remote(file: &Path, selection: &Selection, command: Command) -> Result<()> {
    let graph = load_graph(file)?;
    let hosts = select_hosts(&graph, selection, command.deploy_name())?;
    let deployer = GitDeployer::from_current_dir().context("Failed to read current directory")?;

    info!(
        command = command.verb(),
        hosts = ?hosts.keys().collect::<Vec<_>>(),
        "Running"
    );

    let orchestrator = FleetOrchestrator::new(Arc::new(SshTransport::new()), LineSink::stdout());
    orchestrator
        .run_all(hosts, Arc::new(CommandJob::new(command, deployer)))
        .await
        .into_result()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hap_config::{Hapfile, parse_hapfile};
    use hap_core::{Error, HostOutput, RemoteExit, Session};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    pub(crate) fn graph(text: &str) -> ConfigGraph {
        let hapfile: Hapfile = parse_hapfile(text).unwrap();
        ConfigGraph::from_hapfiles(hapfile, Vec::new())
    }

    /// Records commands and answers every one with `exit`.
    pub(crate) struct MockSession {
        pub host: Host,
        pub exit: RemoteExit,
        pub ssh: Option<String>,
        pub commands: Mutex<Vec<String>>,
    }

    impl MockSession {
        pub(crate) fn new(host: Host, exit: RemoteExit) -> Self {
            Self {
                host,
                exit,
                ssh: None,
                commands: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(["-c", "user.name=hap", "-c", "user.email=hap@example.com"])
            .args(args)
            .current_dir(dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    /// A checkout of `main` at `scratch/site`, a repository accepting pushes
    /// at `remote-home/site`, and an ssh program serving that home.
    pub(crate) fn push_fixture(scratch: &TempDir) -> (PathBuf, String) {
        use std::os::unix::fs::PermissionsExt;

        let work = scratch.path().join("site");
        std::fs::create_dir_all(&work).unwrap();
        git(&work, &["init", "-q"]);
        git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        std::fs::write(work.join("app.txt"), "v1\n").unwrap();
        git(&work, &["add", "app.txt"]);
        git(&work, &["commit", "-q", "-m", "first"]);

        let home = scratch.path().join("remote-home");
        let site = home.join("site");
        std::fs::create_dir_all(&site).unwrap();
        git(&site, &["init", "-q"]);
        git(&site, &["config", "receive.denyCurrentBranch", "ignore"]);

        let ssh = scratch.path().join("fake-ssh");
        let script = format!(
            "#!/bin/sh\nfor last; do :; done\ncd '{home}' && HOME='{home}' exec sh -c \"$last\"\n",
            home = home.display()
        );
        std::fs::write(&ssh, script).unwrap();
        std::fs::set_permissions(&ssh, std::fs::Permissions::from_mode(0o755)).unwrap();
        (work, ssh.display().to_string())
    }

    /// Host reached through [`push_fixture`].
    pub(crate) fn fixture_host() -> Host {
        let mut host = Host::new("web");
        host.addr = "127.0.0.1".to_string();
        host.username = "deploy".to_string();
        host
    }

    #[async_trait]
    impl Session for MockSession {
        fn host(&self) -> &Host {
            &self.host
        }

        async fn run(&self, command: &str, _output: &HostOutput) -> hap_core::Result<RemoteExit> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(self.exit.clone())
        }

        fn ssh_command(&self) -> Option<String> {
            self.ssh.clone()
        }

        async fn close(&self) -> hap_core::Result<()> {
            Ok(())
        }
    }

    fn names(hosts: &BTreeMap<String, Host>) -> Vec<&str> {
        hosts.keys().map(String::as_str).collect()
    }

    const FLEET: &str = r#"
        [host "web1"]
        addr = 10.0.0.1
        [host "web2"]
        addr = 10.0.0.2
        [host "db"]
        addr = 10.0.0.3
        [deploy "app"]
        host = web1
        host = web2
    "#;

    #[test]
    fn test_select_by_glob_and_all() {
        let g = graph(FLEET);
        let web = Selection {
            host: Some("web*".to_string()),
            all: false,
        };
        assert_eq!(names(&select_hosts(&g, &web, None).unwrap()), vec!["web1", "web2"]);

        let all = Selection {
            host: None,
            all: true,
        };
        assert_eq!(names(&select_hosts(&g, &all, None).unwrap()), vec!["db", "web1", "web2"]);
    }

    #[test]
    fn test_select_requires_flag_with_many_hosts() {
        let err = select_hosts(&graph(FLEET), &Selection::default(), None).unwrap_err();
        assert!(err.to_string().contains("--all"));
    }

    #[test]
    fn test_select_only_host() {
        let g = graph("[host \"solo\"]\naddr = 10.0.0.1\n");
        assert_eq!(names(&select_hosts(&g, &Selection::default(), None).unwrap()), vec!["solo"]);
    }

    #[test]
    fn test_select_default_host() {
        let g = graph(&format!("[default]\naddr = 10.0.0.9\n{}", FLEET));
        let hosts = select_hosts(&g, &Selection::default(), None).unwrap();
        assert_eq!(names(&hosts), vec!["default"]);
        assert_eq!(hosts["default"].addr, "10.0.0.9");
    }

    #[test]
    fn test_select_no_match() {
        let sel = Selection {
            host: Some("cache*".to_string()),
            all: false,
        };
        let err = select_hosts(&graph(FLEET), &sel, None).unwrap_err();
        assert!(err.to_string().contains("cache*"));
    }

    #[test]
    fn test_select_deploy_hosts() {
        let g = graph(FLEET);
        assert_eq!(
            names(&select_hosts(&g, &Selection::default(), Some("app")).unwrap()),
            vec!["web1", "web2"]
        );

        let narrowed = Selection {
            host: Some("web2".to_string()),
            all: false,
        };
        assert_eq!(names(&select_hosts(&g, &narrowed, Some("app")).unwrap()), vec!["web2"]);

        let err = select_hosts(&g, &Selection::default(), Some("missing")).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_arbitrary_command_job() {
        let mut host = Host::new("web1");
        host.addr = "10.0.0.1".to_string();
        let session = MockSession::new(host.clone(), RemoteExit::success());
        let sink = LineSink::capture();
        let ctx = HostContext {
            host: &host,
            session: Some(&session),
            output: sink.for_host("web1"),
        };

        let job = CommandJob::new(
            Command::Arbitrary {
                command: "uptime".to_string(),
            },
            GitDeployer::new("/src/site"),
        );
        assert_eq!(job.name(), "c");
        assert_eq!(job.run(&ctx).await.unwrap(), "`uptime` completed.");

        let sent = session.commands.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].ends_with("uptime"));
        assert!(sent[0].contains("export HAP_HOSTNAME='web1';"));
    }

    #[tokio::test]
    async fn test_job_without_session() {
        let host = Host::new("web1");
        let ctx = HostContext {
            host: &host,
            session: None,
            output: LineSink::capture().for_host("web1"),
        };
        let job = CommandJob::new(Command::Push, GitDeployer::new("/src/site"));
        let failure = job.run(&ctx).await.unwrap_err();
        assert!(matches!(failure.source, Error::NoSession(_)));
    }

    #[tokio::test]
    async fn test_deploy_job_skips_guard() {
        let scratch = TempDir::new().unwrap();
        let (work, ssh) = push_fixture(&scratch);
        let g = graph(
            r#"
            [host "web"]
            addr = 127.0.0.1
            username = deploy
            cmd = echo build
            [deploy "prod"]
            host = web
            cmd = echo deploy
            "#,
        );
        let hosts = select_hosts(&g, &Selection::default(), Some("prod")).unwrap();
        let host = &hosts["web"];

        let mut session = MockSession::new(host.clone(), RemoteExit::success());
        session.ssh = Some(ssh);
        let sink = LineSink::capture();
        let ctx = HostContext {
            host,
            session: Some(&session),
            output: sink.for_host("web"),
        };
        let job = CommandJob::new(
            Command::Deploy {
                name: "prod".to_string(),
            },
            GitDeployer::new(&work),
        );
        assert_eq!(job.run(&ctx).await.unwrap(), "deploy completed.");

        let sent = session.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("echo deploy"));
        assert!(!sent[0].contains("echo build"));
        assert!(!sent[0].contains("exit 86"));
        assert!(scratch.path().join("remote-home/site/.git/refs/heads/main").is_file());
    }

    #[tokio::test]
    async fn test_build_job_runs_guard_first() {
        let scratch = TempDir::new().unwrap();
        let (work, ssh) = push_fixture(&scratch);
        let mut session = MockSession::new(fixture_host(), RemoteExit::success());
        session.ssh = Some(ssh);
        let host = fixture_host();
        let ctx = HostContext {
            host: &host,
            session: Some(&session),
            output: LineSink::capture().for_host("web"),
        };
        let job = CommandJob::new(Command::Build { force: false }, GitDeployer::new(&work));
        assert_eq!(job.run(&ctx).await.unwrap(), "build completed.");

        let sent = session.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("exit 86"));
        assert!(!sent[1].contains("exit 86"));
    }
}
