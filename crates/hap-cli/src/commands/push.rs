//! `hap push`

use hap_deployer::{GitDeployer, Remote};
use hap_scheduler::JobFailure;

pub async fn run(deployer: &GitDeployer, remote: &Remote<'_>) -> Result<String, JobFailure> {
    push_all(deployer, remote).await?;
    Ok("push completed.".to_string())
}

/// Push the checkout, then its submodules.
pub(crate) async fn push_all(deployer: &GitDeployer, remote: &Remote<'_>) -> Result<(), JobFailure> {
    let pushed = match deployer.push(remote).await {
        Ok(()) => deployer.push_submodules(remote).await,
        Err(e) => Err(e),
    };
    pushed.map_err(|e| JobFailure::new("push failed.", e))
}
