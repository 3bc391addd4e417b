//! SSH transport.
//!
//! Sessions are OpenSSH control masters: [`SshTransport::open`] authenticates
//! once and leaves a master connection listening on a private control socket,
//! and every command of the session (including `git push`, through
//! [`Session::ssh_command`]) is multiplexed over it.

use async_trait::async_trait;
use hap_core::{AuthKind, Error, Host, HostOutput, RemoteExit, Result, Session, Transport};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::runner::shell_quote;

/// Key files tried under `~/.ssh` when a host has no identity.
pub const DEFAULT_KEYS: &[&str] = &["id_rsa", "id_ecdsa", "id_ed25519", "id_dsa"];

/// Overrides the ssh program.
pub const SSH_PROGRAM_ENV: &str = "HAP_SSH";

/// Carries the password to the askpass helper.
const PASSWORD_ENV: &str = "HAP_SSH_PASSWORD";

const DEFAULT_PORT: u16 = 22;

/// Split `host`, `host:port` or `[v6]:port` into host and port.
pub fn split_addr(addr: &str) -> Result<(String, u16)> {
    let invalid = |message: &str| Error::InvalidInput(format!("address {}: {}", addr, message));

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid("missing ']'"))?;
        let port = match tail {
            "" => DEFAULT_PORT,
            _ => tail
                .strip_prefix(':')
                .ok_or_else(|| invalid("expected ':' after ']'"))?
                .parse()
                .map_err(|_| invalid("invalid port"))?,
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some((host, _)) if host.contains(':') => Ok((addr.to_string(), DEFAULT_PORT)),
        Some((host, port)) => {
            let port = port.parse().map_err(|_| invalid("invalid port"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), DEFAULT_PORT)),
    }
}

/// The credentials offered for one host, in the order they are tried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthPlan {
    pub kinds: Vec<AuthKind>,
    /// Key files passed with `-i`.
    pub identities: Vec<PathBuf>,
    pub password: Option<String>,
}

impl AuthPlan {
    /// Build the plan from the process environment.
    pub fn from_env(host: &Host) -> Self {
        let agent = std::env::var_os("SSH_AUTH_SOCK").is_some_and(|s| !s.is_empty());
        Self::for_host(host, agent, dirs::home_dir().as_deref())
    }

    /// Agent keys, then the configured identity or else whichever default
    /// keys exist, then the password.
    pub fn for_host(host: &Host, agent: bool, home: Option<&Path>) -> Self {
        let mut plan = AuthPlan::default();

        if agent {
            plan.kinds.push(AuthKind::Agent);
        }

        if !host.identity.is_empty() {
            plan.kinds.push(AuthKind::Identity);
            plan.identities.push(expand_home(&host.identity, home));
        } else if let Some(home) = home {
            let found: Vec<PathBuf> = DEFAULT_KEYS
                .iter()
                .map(|key| home.join(".ssh").join(key))
                .filter(|path| path.is_file())
                .collect();
            if !found.is_empty() {
                plan.kinds.push(AuthKind::DefaultKeys);
                plan.identities = found;
            }
        }

        if !host.password.is_empty() {
            plan.kinds.push(AuthKind::Password);
            plan.password = Some(host.password.clone());
        }

        plan
    }

    /// ssh options implementing the plan.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for identity in &self.identities {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        args.push("-o".to_string());
        args.push("StrictHostKeyChecking=accept-new".to_string());
        if self.password.is_some() {
            args.push("-o".to_string());
            args.push("PreferredAuthentications=publickey,keyboard-interactive,password".to_string());
            args.push("-o".to_string());
            args.push("NumberOfPasswordPrompts=1".to_string());
        } else {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        args
    }
}

fn expand_home(path: &str, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix('~'), home) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(path),
    }
}

/// Opens sessions with the OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshTransport {
    program: String,
}

impl SshTransport {
    /// Use `ssh`, or the program named by `HAP_SSH`.
    pub fn new() -> Self {
        let program = std::env::var(SSH_PROGRAM_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "ssh".to_string());
        Self { program }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open(&self, host: &Host) -> Result<Box<dyn Session>> {
        if host.addr.is_empty() {
            return Err(Error::InvalidInput(format!("host {} has no addr", host.name)));
        }
        let (ip, port) = split_addr(&host.addr)?;
        let plan = AuthPlan::from_env(host);
        let connect_error = |message: String| Error::Connect {
            addr: host.addr.clone(),
            attempted: plan.kinds.clone(),
            message,
        };

        let dir = tempfile::Builder::new().prefix("hap-ssh-").tempdir()?;
        let control = dir.path().join("control");
        let target = if host.username.is_empty() {
            ip
        } else {
            format!("{}@{}", host.username, ip)
        };

        // The detached master may keep inherited descriptors open, so its
        // stderr goes to a file rather than a pipe.
        let log_path = dir.path().join("connect.log");
        let log = std::fs::File::create(&log_path)?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("-M")
            .arg("-S")
            .arg(&control)
            .args(["-o", "ControlPersist=yes", "-N", "-f"])
            .arg("-p")
            .arg(port.to_string())
            .args(plan.args())
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));

        if let Some(password) = &plan.password {
            let askpass = write_askpass(dir.path())?;
            cmd.env("SSH_ASKPASS", askpass)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env(PASSWORD_ENV, password);
            if std::env::var_os("DISPLAY").is_none() {
                cmd.env("DISPLAY", ":0");
            }
        }

        debug!(
            host = %host.name,
            target = %target,
            port = port,
            auth = %AuthKind::join(&plan.kinds),
            "Opening ssh master"
        );

        let status = cmd
            .status()
            .await
            .map_err(|e| connect_error(format!("failed to run {}: {}", self.program, e)))?;

        if !status.success() {
            let log = std::fs::read_to_string(&log_path).unwrap_or_default();
            let message = match log.trim() {
                "" => format!("ssh exited with {}", status),
                text => text.to_string(),
            };
            warn!(host = %host.name, addr = %host.addr, "Connection failed");
            return Err(connect_error(message));
        }

        info!(host = %host.name, addr = %host.addr, "Session opened");

        Ok(Box::new(SshSession {
            host: host.clone(),
            program: self.program.clone(),
            target,
            port,
            control,
            closed: AtomicBool::new(false),
            _dir: dir,
        }))
    }
}

fn write_askpass(dir: &Path) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("askpass");
    std::fs::write(&path, format!("#!/bin/sh\nprintf '%s\\n' \"${}\"\n", PASSWORD_ENV))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    Ok(path)
}

/// A session multiplexed over an ssh control master.
pub struct SshSession {
    host: Host,
    program: String,
    target: String,
    port: u16,
    control: PathBuf,
    closed: AtomicBool,
    /// Holds the control socket and askpass helper.
    _dir: TempDir,
}

impl SshSession {
    fn client(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-S")
            .arg(&self.control)
            .args(["-o", "ControlMaster=no"])
            .arg("-p")
            .arg(self.port.to_string());
        cmd
    }

    fn exit_master_blocking(&self) {
        let _ = std::process::Command::new(&self.program)
            .arg("-S")
            .arg(&self.control)
            .args(["-O", "exit"])
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

#[async_trait]
impl Session for SshSession {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn run(&self, command: &str, output: &HostOutput) -> Result<RemoteExit> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NoSession(self.host.name.clone()));
        }

        debug!(host = %self.host.name, command = %command, "Running remote command");

        let mut child = self
            .client()
            .arg(&self.target)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (out, err) = tokio::join!(pump(stdout, output, false), pump(stderr, output, true));
        out?;
        let stderr = err?;

        let status = child.wait().await?;
        Ok(RemoteExit {
            code: status.code(),
            stderr: String::from_utf8_lossy(&stderr).trim_end().to_string(),
        })
    }

    fn ssh_command(&self) -> Option<String> {
        Some(format!(
            "{} -S {} -o ControlMaster=no",
            shell_quote(&self.program),
            shell_quote(&self.control.to_string_lossy())
        ))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let status = Command::new(&self.program)
            .arg("-S")
            .arg(&self.control)
            .args(["-O", "exit"])
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => {
                debug!(host = %self.host.name, "Session closed");
            }
            Ok(status) => {
                debug!(host = %self.host.name, status = %status, "Control master already gone");
            }
            Err(e) => {
                debug!(host = %self.host.name, error = %e, "Failed to stop control master");
            }
        }
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.exit_master_blocking();
        }
    }
}

/// Copy a child stream into host-tagged lines, optionally keeping the bytes.
async fn pump<R: AsyncRead + Unpin>(
    reader: Option<R>,
    output: &HostOutput,
    keep: bool,
) -> std::io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let Some(mut reader) = reader else {
        return Ok(kept);
    };
    let mut writer = output.writer();
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n]);
        if keep {
            kept.extend_from_slice(&buf[..n]);
        }
    }
    writer.flush();
    Ok(kept)
}
