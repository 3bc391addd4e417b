//! Remote command composition.

use hap_core::{Error, Host, HostOutput, Result, Session};
use std::collections::BTreeMap;
use tracing::debug;

use crate::ssh::split_addr;

/// Quote a string for POSIX `sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// The identity variables exported to every remote command.
pub fn host_env(host: &Host) -> Result<BTreeMap<String, String>> {
    let (ip, port) = split_addr(&host.addr)?;
    Ok(BTreeMap::from([
        ("HAP_HOSTNAME".to_string(), host.name.clone()),
        ("HAP_ADDR".to_string(), host.addr.clone()),
        ("HAP_USER".to_string(), host.username.clone()),
        ("HAP_IP".to_string(), ip),
        ("HAP_PORT".to_string(), port.to_string()),
    ]))
}

/// Runs command lists on a session as one remote invocation.
///
/// Multiple commands are joined with `&&` inside `sh -c`, so the first
/// failing command stops the rest.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    env: BTreeMap<String, String>,
}

impl CommandRunner {
    pub fn new(env: BTreeMap<String, String>) -> Self {
        Self { env }
    }

    /// A runner exporting the host's identity variables.
    pub fn for_host(host: &Host) -> Result<Self> {
        Ok(Self::new(host_env(host)?))
    }

    /// The command line sent to the remote shell. `None` for an empty list.
    pub fn compose(&self, commands: &[String]) -> Option<String> {
        let exports = self.exports();
        match commands {
            [] => None,
            [single] => Some(format!("{}{}", exports, single)),
            many => Some(format!(
                "sh -c {}",
                shell_quote(&format!("{}{}", exports, many.join(" && ")))
            )),
        }
    }

    fn exports(&self) -> String {
        self.env
            .iter()
            .map(|(key, value)| format!("export {}={}; ", key, shell_quote(value)))
            .collect()
    }

    /// Run the commands and fail on a nonzero exit.
    pub async fn run(
        &self,
        session: &dyn Session,
        commands: &[String],
        output: &HostOutput,
    ) -> Result<()> {
        let Some(line) = self.compose(commands) else {
            debug!(host = %output.name(), "No commands to run");
            return Ok(());
        };

        let exit = session.run(&line, output).await?;
        if exit.is_success() {
            Ok(())
        } else {
            debug!(host = %output.name(), code = ?exit.code, "Remote command failed");
            Err(Error::Exec {
                code: exit.code,
                stderr: exit.stderr,
            })
        }
    }
}
