//! `hap build` and `hap deploy`

use anyhow::Result;
use hap_core::{Error, Host, LineSink};
use hap_deployer::{GitDeployer, Remote};
use hap_scheduler::JobFailure;
use std::collections::BTreeMap;
use std::path::Path;

use super::{Selection, load_graph, push::push_all, select_hosts};

/// Push, then run the build script.
pub async fn run(
    deployer: &GitDeployer,
    remote: &Remote<'_>,
    force: bool,
) -> std::result::Result<String, JobFailure> {
    push_all(deployer, remote).await?;
    summarize("build", deployer.build(remote, force).await)
}

/// Push, then run the deploy's script. `remote.host` is the deploy view.
pub async fn deploy(
    deployer: &GitDeployer,
    remote: &Remote<'_>,
) -> std::result::Result<String, JobFailure> {
    push_all(deployer, remote).await?;
    summarize("deploy", deployer.deploy(remote).await)
}

fn summarize(verb: &str, result: hap_core::Result<()>) -> std::result::Result<String, JobFailure> {
    match result {
        Ok(()) => Ok(format!("{} completed.", verb)),
        Err(Error::AlreadyCompleted) => Ok(format!("{} already completed.", verb)),
        Err(e) => Err(JobFailure::new(format!("{} failed.", verb), e)),
    }
}

/// Print the script for each selected host without connecting. `force`
/// leaves out the guard.
pub fn dry_run(file: &Path, selection: &Selection, deploy: Option<&str>, force: bool) -> Result<()> {
    let graph = load_graph(file)?;
    let hosts = select_hosts(&graph, selection, deploy)?;
    let deployer = GitDeployer::from_current_dir()?;
    render_dry_run(&LineSink::stdout(), &deployer, &hosts, force)
}

fn render_dry_run(
    sink: &LineSink,
    deployer: &GitDeployer,
    hosts: &BTreeMap<String, Host>,
    force: bool,
) -> Result<()> {
    for host in hosts.values() {
        let output = sink.for_host(&host.name);
        output.line("--dry run.");
        if !force {
            for command in deployer.guard_commands(host)? {
                output.line(&command);
            }
        }
        for command in deployer.build_commands(host)? {
            output.line(&command);
        }
        output.line("--dry run completed.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::graph;

    #[test]
    fn test_summarize_already_completed_is_success() {
        assert_eq!(summarize("build", Ok(())).unwrap(), "build completed.");
        assert_eq!(
            summarize("deploy", Err(Error::AlreadyCompleted)).unwrap(),
            "deploy already completed."
        );

        let failure = summarize(
            "build",
            Err(Error::Exec {
                code: Some(2),
                stderr: "make: *** failed".to_string(),
            }),
        )
        .unwrap_err();
        assert_eq!(failure.summary, "build failed.");
        assert_eq!(failure.source.exit_code(), Some(2));
    }

    #[test]
    fn test_dry_run_lists_deploy_script() {
        let g = graph(
            r#"
            [host "web"]
            addr = 10.0.0.1
            cmd = echo host
            [build "release"]
            cmd = make release
            [deploy "prod"]
            host = web
            build = release
            env = prod.env
            "#,
        );
        let hosts = select_hosts(&g, &Selection::default(), Some("prod")).unwrap();
        let sink = LineSink::capture();
        render_dry_run(&sink, &GitDeployer::new("/src/site"), &hosts, true).unwrap();

        assert_eq!(
            sink.lines(),
            vec![
                "[web] --dry run.",
                "[web] cd 'site'",
                "[web] . ./'prod.env'",
                "[web] make release",
                "[web] git rev-parse HEAD > .happended",
                "[web] --dry run completed.",
            ]
        );
    }

    #[test]
    fn test_dry_run_build_shows_guard() {
        let g = graph("[host \"web\"]\naddr = 10.0.0.1\ncmd = make\n");
        let hosts = select_hosts(&g, &Selection::default(), None).unwrap();
        let sink = LineSink::capture();
        render_dry_run(&sink, &GitDeployer::new("/src/site"), &hosts, false).unwrap();

        let lines = sink.lines();
        assert_eq!(lines[1], "[web] cd 'site'");
        assert_eq!(lines[2], "[web] touch .happended");
        assert!(lines[3].contains("exit 86"));
        assert_eq!(lines[4], "[web] cd 'site'");
        assert_eq!(lines[5], "[web] make");
    }
}
