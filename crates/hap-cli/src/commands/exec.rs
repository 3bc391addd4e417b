//! `hap exec` and `hap c`

use hap_deployer::{GitDeployer, Remote};
use hap_executor::CommandRunner;
use hap_scheduler::JobFailure;

use super::push::push_all;

/// Push, then run a script from the checkout inside the remote directory.
pub async fn script(
    deployer: &GitDeployer,
    remote: &Remote<'_>,
    script: &str,
) -> Result<String, JobFailure> {
    push_all(deployer, remote).await?;
    let dir = deployer.remote_dir(&remote.host)?;
    let commands = vec![format!("cd {}", hap_executor::shell_quote(&dir)), script_path(script)];
    run(remote, &commands, script).await
}

/// Run a command as given, from the remote home.
pub async fn arbitrary(remote: &Remote<'_>, command: &str) -> Result<String, JobFailure> {
    run(remote, &[command.to_string()], command).await
}

async fn run(remote: &Remote<'_>, commands: &[String], label: &str) -> Result<String, JobFailure> {
    let runner = CommandRunner::for_host(&remote.host)?;
    match runner.run(remote.session, commands, &remote.output).await {
        Ok(()) => Ok(format!("`{}` completed.", label)),
        Err(e) => Err(JobFailure::new(format!("`{}` failed.", label), e)),
    }
}

fn script_path(script: &str) -> String {
    if script.starts_with('/') || script.starts_with("./") {
        script.to_string()
    } else {
        format!("./{}", script)
    }
}
