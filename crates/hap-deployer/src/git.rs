//! Git deployment to remote hosts.

use futures::future::join_all;
use hap_config::parse_sections;
use hap_core::{Error, Host, HostFailure, HostOutput, Result, Session};
use hap_executor::{CommandRunner, shell_quote};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Marker holding the commit of the last completed build.
pub const MARKER_FILE: &str = ".happended";

/// Exit status of the build guard when the marker matches `HEAD`.
pub const ALREADY_COMPLETED_CODE: i32 = 86;

/// Branch pushed when the local checkout has a detached HEAD.
pub const DETACHED_BRANCH: &str = "hap-detached";

/// Installed as `.git/hooks/post-receive` on every host.
pub const POST_RECEIVE_HOOK: &str = r#"#!/bin/bash
test "${PWD%/.git}" != "$PWD" && cd ..
unset GIT_DIR GIT_WORK_TREE
read oldrev newrev ref
branch=${ref#refs/heads/}
git reset -q --hard
git checkout -q ${branch}"#;

/// A host reached through an open session.
///
/// `host` may differ from `session.host()` in its directory when the remote
/// is scoped to a submodule.
pub struct Remote<'a> {
    pub host: Host,
    pub session: &'a dyn Session,
    pub output: HostOutput,
}

impl<'a> Remote<'a> {
    pub fn new(session: &'a dyn Session, output: HostOutput) -> Self {
        Self {
            host: session.host().clone(),
            session,
            output,
        }
    }

    /// The same session with the working directory replaced.
    pub fn scoped(&self, dir: impl Into<String>) -> Remote<'a> {
        let mut host = self.host.clone();
        host.dir = dir.into();
        Remote {
            host,
            session: self.session,
            output: self.output.clone(),
        }
    }
}

/// Deploys a local checkout to remotes.
#[derive(Debug, Clone)]
pub struct GitDeployer {
    work: PathBuf,
    default_dir: String,
    program: String,
}

impl GitDeployer {
    /// Deploy the checkout at `work`. Hosts without a `dir` use the
    /// checkout's directory name.
    pub fn new(work: impl Into<PathBuf>) -> Self {
        let work = work.into();
        let default_dir = work
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            work,
            default_dir,
            program: "git".to_string(),
        }
    }

    /// Deploy the current directory.
    pub fn from_current_dir() -> Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    /// Remote working directory, relative to the remote home.
    pub fn remote_dir(&self, host: &Host) -> Result<String> {
        let dir = if host.dir.is_empty() {
            &self.default_dir
        } else {
            &host.dir
        };
        if dir.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no remote directory for {}",
                host.name
            )));
        }
        Ok(dir.clone())
    }

    /// `ssh://{user}@{addr}/~/{dir}`
    pub fn remote_url(&self, host: &Host) -> Result<String> {
        let dir = self.remote_dir(host)?;
        Ok(if host.username.is_empty() {
            format!("ssh://{}/~/{}", host.addr, dir)
        } else {
            format!("ssh://{}@{}/~/{}", host.username, host.addr, dir)
        })
    }

    /// Commands creating the remote repository and hook.
    pub fn init_commands(&self, host: &Host) -> Result<Vec<String>> {
        let dir = shell_quote(&self.remote_dir(host)?);
        Ok(vec![
            format!("mkdir -p {}", dir),
            format!("cd {}", dir),
            "git init -q".to_string(),
            "git config receive.denyCurrentBranch ignore".to_string(),
            format!(
                "printf '%s\\n' {} > .git/hooks/post-receive",
                shell_quote(POST_RECEIVE_HOOK)
            ),
            "chmod a+x .git/hooks/post-receive".to_string(),
        ])
    }

    /// Create the remote repository and install the post-receive hook.
    /// Running it again only refreshes the hook.
    pub async fn initialize(&self, remote: &Remote<'_>) -> Result<()> {
        let commands = self.init_commands(&remote.host)?;
        let runner = CommandRunner::for_host(&remote.host)?;
        runner
            .run(remote.session, &commands, &remote.output)
            .await
            .map_err(|e| match e {
                Error::Exec { stderr, .. } => Error::Git {
                    action: "init".to_string(),
                    output: stderr,
                },
                other => other,
            })?;
        info!(host = %remote.host.name, dir = %remote.host.dir, "Remote repository initialized");
        Ok(())
    }

    /// Name of the checked out branch, `HEAD` when detached.
    pub async fn current_branch(&self) -> Result<String> {
        let output = self
            .git(&self.work, &["rev-parse", "--abbrev-ref", "HEAD"], None)
            .await?;
        Ok(output.trim().to_string())
    }

    /// Force-push the current branch to the remote.
    pub async fn push(&self, remote: &Remote<'_>) -> Result<()> {
        let branch = self.current_branch().await?;
        let refspec = refspec(&branch);
        let url = self.remote_url(&remote.host)?;
        debug!(host = %remote.host.name, url = %url, refspec = %refspec, "Pushing");

        let ssh = remote.session.ssh_command();
        let output = self
            .git(&self.work, &["push", "-f", &url, &refspec], ssh.as_deref())
            .await;
        match output {
            Ok(text) => {
                remote.output.lines(&text);
                info!(host = %remote.host.name, refspec = %refspec, "Pushed");
                Ok(())
            }
            Err(e) => {
                if let Error::Git { output, .. } = &e {
                    remote.output.lines(output);
                }
                Err(e)
            }
        }
    }

    /// Initialize and push every submodule into its own subdirectory of the
    /// remote. Submodules run concurrently; all failures are reported.
    pub async fn push_submodules(&self, remote: &Remote<'_>) -> Result<()> {
        let paths = self.submodule_paths()?;
        if paths.is_empty() {
            return Ok(());
        }

        self.git(&self.work, &["submodule", "update", "--init"], None)
            .await
            .map(|text| remote.output.lines(&text))?;

        let base = self.remote_dir(&remote.host)?;
        let pushes = paths.iter().map(|path| {
            let deployer = GitDeployer {
                work: self.work.join(path),
                default_dir: self.default_dir.clone(),
                program: self.program.clone(),
            };
            let scoped = remote.scoped(format!("{}/{}", base, path));
            async move {
                deployer.initialize(&scoped).await?;
                deployer.push(&scoped).await
            }
        });

        let failures: Vec<HostFailure> = paths
            .iter()
            .zip(join_all(pushes).await)
            .filter_map(|(path, result)| {
                result.err().map(|e| {
                    warn!(host = %remote.host.name, submodule = %path, error = %e, "Submodule push failed");
                    HostFailure::new(path.clone(), e.to_string())
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Submodules(failures))
        }
    }

    fn submodule_paths(&self) -> Result<Vec<String>> {
        let text = match std::fs::read_to_string(self.work.join(".gitmodules")) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let sections =
            parse_sections(&text).map_err(|e| Error::InvalidInput(format!(".gitmodules: {}", e)))?;
        Ok(sections
            .iter()
            .filter(|s| s.kind == "submodule")
            .filter_map(|s| s.last("path"))
            .map(str::to_string)
            .collect())
    }

    /// The guard run before a build: stop with
    /// [`ALREADY_COMPLETED_CODE`] when `HEAD` matches the marker.
    pub fn guard_commands(&self, host: &Host) -> Result<Vec<String>> {
        Ok(vec![
            format!("cd {}", shell_quote(&self.remote_dir(host)?)),
            format!("touch {}", MARKER_FILE),
            format!(
                "if [ \"$(git rev-parse HEAD)\" = \"$(cat {})\" ]; then echo \"Already completed. Commit again?\"; exit {}; fi",
                MARKER_FILE, ALREADY_COMPLETED_CODE
            ),
        ])
    }

    /// The build script: enter the directory, source env files, run the
    /// host's commands and record the commit.
    pub fn build_commands(&self, host: &Host) -> Result<Vec<String>> {
        let mut commands = vec![format!("cd {}", shell_quote(&self.remote_dir(host)?))];
        commands.extend(host.env.iter().map(|file| source_command(file)));
        commands.extend(host.commands().iter().cloned());
        commands.push(format!("git rev-parse HEAD > {}", MARKER_FILE));
        Ok(commands)
    }

    /// Run the build script, after the guard unless forced.
    ///
    /// The guard runs as its own remote command, so only its exit maps to
    /// [`Error::AlreadyCompleted`]. Build commands exiting with the same
    /// status are reported as [`Error::Exec`].
    pub async fn build(&self, remote: &Remote<'_>, force: bool) -> Result<()> {
        let runner = CommandRunner::for_host(&remote.host)?;
        if !force {
            let guard = self.guard_commands(&remote.host)?;
            match runner.run(remote.session, &guard, &remote.output).await {
                Err(e) if e.exit_code() == Some(ALREADY_COMPLETED_CODE) => {
                    info!(host = %remote.host.name, "Build already completed");
                    return Err(Error::AlreadyCompleted);
                }
                other => other?,
            }
        }
        let commands = self.build_commands(&remote.host)?;
        runner.run(remote.session, &commands, &remote.output).await
    }

    /// Run a deploy's script. Deploys carry their own commands, so the
    /// marker left by a build of the same commit never skips them.
    pub async fn deploy(&self, remote: &Remote<'_>) -> Result<()> {
        self.build(remote, true).await
    }

    /// Run git in `dir` and return its combined output.
    async fn git(&self, dir: &Path, args: &[&str], ssh: Option<&str>) -> Result<String> {
        let action = args.first().copied().unwrap_or_default().to_string();
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ssh) = ssh {
            cmd.env("GIT_SSH_COMMAND", ssh);
        }

        let output = cmd.output().await.map_err(|e| Error::Git {
            action: action.clone(),
            output: format!("failed to run {} in {}: {}", self.program, dir.display(), e),
        })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(text)
        } else {
            Err(Error::Git {
                action,
                output: text.trim_end().to_string(),
            })
        }
    }
}

/// The refspec pushed for a branch name from `rev-parse --abbrev-ref`.
fn refspec(branch: &str) -> String {
    if branch == "HEAD" {
        format!("HEAD:refs/heads/{}", DETACHED_BRANCH)
    } else {
        branch.to_string()
    }
}

fn source_command(file: &str) -> String {
    if file.contains('/') {
        format!(". {}", shell_quote(file))
    } else {
        format!(". ./{}", shell_quote(file))
    }
}
