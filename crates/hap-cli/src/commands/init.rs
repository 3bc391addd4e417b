//! `hap init`

use hap_deployer::{GitDeployer, Remote};
use hap_scheduler::JobFailure;

pub async fn run(deployer: &GitDeployer, remote: &Remote<'_>) -> Result<String, JobFailure> {
    let dir = deployer.remote_dir(&remote.host)?;
    match deployer.initialize(remote).await {
        Ok(()) => Ok(format!("init {} completed.", dir)),
        Err(e) => Err(JobFailure::new(format!("init {} failed.", dir), e)),
    }
}
