//! Fleet orchestrator - runs one job on many hosts concurrently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use hap_core::{Error, Host, HostFailure, HostOutput, LineSink, Result, Session, Transport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// State of one host during a fleet run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HostState {
    Pending,
    Connecting,
    Executing,
    Succeeded,
    Failed { message: String },
}

impl HostState {
    pub fn is_success(&self) -> bool {
        matches!(self, HostState::Succeeded)
    }
}

/// Event emitted during a fleet run.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    HostStateChanged { host: String, state: HostState },
    HostCompleted { report: HostReport },
    FleetCompleted { success: bool },
}

/// What a job sees while running on one host.
pub struct HostContext<'a> {
    pub host: &'a Host,
    /// `None` when the job does not need a session.
    pub session: Option<&'a dyn Session>,
    pub output: HostOutput,
}

impl<'a> HostContext<'a> {
    /// The open session, or [`Error::NoSession`].
    pub fn session(&self) -> Result<&'a dyn Session> {
        self.session
            .ok_or_else(|| Error::NoSession(self.host.name.clone()))
    }
}

/// A failed job: the line to print and the cause.
#[derive(Debug)]
pub struct JobFailure {
    pub summary: String,
    pub source: Error,
}

impl JobFailure {
    pub fn new(summary: impl Into<String>, source: Error) -> Self {
        Self {
            summary: summary.into(),
            source,
        }
    }
}

impl From<Error> for JobFailure {
    fn from(source: Error) -> Self {
        Self {
            summary: source.to_string(),
            source,
        }
    }
}

/// Work run once per host.
#[async_trait]
pub trait HostJob: Send + Sync {
    /// Short verb used in logs and connect-failure lines.
    fn name(&self) -> &str;

    /// Whether a session is opened before [`HostJob::run`].
    fn requires_session(&self) -> bool {
        true
    }

    /// Run on one host and return the result line.
    async fn run(&self, ctx: &HostContext<'_>) -> std::result::Result<String, JobFailure>;
}

/// Outcome for one host.
#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host: String,
    pub state: HostState,
    /// The result line printed for the host.
    pub summary: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Result of a fleet run.
#[derive(Debug)]
pub struct FleetResult {
    pub success: bool,
    pub reports: BTreeMap<String, HostReport>,
}

impl FleetResult {
    pub fn failures(&self) -> Vec<HostFailure> {
        self.reports
            .values()
            .filter_map(|r| match &r.state {
                HostState::Failed { message } => Some(HostFailure::new(&r.host, message)),
                _ => None,
            })
            .collect()
    }

    /// The reports, or [`Error::PartialFleet`] naming every failed host.
    pub fn into_result(self) -> Result<BTreeMap<String, HostReport>> {
        let failures = self.failures();
        if failures.is_empty() {
            Ok(self.reports)
        } else {
            Err(Error::PartialFleet(failures))
        }
    }
}

/// Fans a job out over hosts.
pub struct FleetOrchestrator {
    transport: Arc<dyn Transport>,
    sink: LineSink,
}

impl FleetOrchestrator {
    pub fn new(transport: Arc<dyn Transport>, sink: LineSink) -> Self {
        Self { transport, sink }
    }

    /// Start the job on every host, returning a channel of events and a
    /// handle to the final result.
    pub fn execute(
        &self,
        hosts: BTreeMap<String, Host>,
        job: Arc<dyn HostJob>,
    ) -> (mpsc::Receiver<FleetEvent>, tokio::task::JoinHandle<FleetResult>) {
        let (tx, rx) = mpsc::channel(100);
        let transport = self.transport.clone();
        let sink = self.sink.clone();

        let handle = tokio::spawn(async move { Self::execute_inner(transport, sink, hosts, job, tx).await });

        (rx, handle)
    }

    /// Run the job on every host and wait for all of them.
    pub async fn run_all(&self, hosts: BTreeMap<String, Host>, job: Arc<dyn HostJob>) -> FleetResult {
        let (mut rx, handle) = self.execute(hosts, job);
        while let Some(event) = rx.recv().await {
            if let FleetEvent::HostStateChanged { host, state } = &event {
                debug!(host = %host, state = ?state, "Host state changed");
            }
        }
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Fleet task failed");
                FleetResult {
                    success: false,
                    reports: BTreeMap::new(),
                }
            }
        }
    }

    async fn execute_inner(
        transport: Arc<dyn Transport>,
        sink: LineSink,
        hosts: BTreeMap<String, Host>,
        job: Arc<dyn HostJob>,
        tx: mpsc::Sender<FleetEvent>,
    ) -> FleetResult {
        info!(job = %job.name(), hosts = hosts.len(), "Starting fleet run");

        let mut names = Vec::with_capacity(hosts.len());
        let mut handles = Vec::with_capacity(hosts.len());
        for (name, host) in hosts {
            let _ = tx
                .send(FleetEvent::HostStateChanged {
                    host: name.clone(),
                    state: HostState::Pending,
                })
                .await;
            let task = run_host(transport.clone(), job.clone(), host, sink.clone(), tx.clone());
            names.push(name);
            handles.push(tokio::spawn(task));
        }

        let mut reports = BTreeMap::new();
        for (name, joined) in names.into_iter().zip(join_all(handles).await) {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    error!(host = %name, error = %e, "Host task panicked");
                    let now = Utc::now();
                    let message = format!("task aborted: {}", e);
                    sink.for_host(&name).line(&message);
                    HostReport {
                        host: name.clone(),
                        state: HostState::Failed { message: message.clone() },
                        summary: message,
                        started_at: now,
                        finished_at: now,
                    }
                }
            };
            reports.insert(name, report);
        }

        let success = reports.values().all(|r| r.state.is_success());
        info!(job = %job.name(), success = success, "Fleet run completed");
        let _ = tx.send(FleetEvent::FleetCompleted { success }).await;

        FleetResult { success, reports }
    }
}

async fn run_host(
    transport: Arc<dyn Transport>,
    job: Arc<dyn HostJob>,
    host: Host,
    sink: LineSink,
    tx: mpsc::Sender<FleetEvent>,
) -> HostReport {
    let started_at = Utc::now();
    let output = sink.for_host(&host.name);
    let set_state = |state: HostState| {
        let tx = tx.clone();
        let host = host.name.clone();
        async move {
            let _ = tx.send(FleetEvent::HostStateChanged { host, state }).await;
        }
    };

    let session = if job.requires_session() {
        set_state(HostState::Connecting).await;
        match transport.open(&host).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(host = %host.name, addr = %host.addr, error = %e, "Connect failed");
                let failure = JobFailure::new(format!("{} failed.", job.name()), e);
                return finish(&host, &output, Err(failure), started_at, &tx).await;
            }
        }
    } else {
        None
    };

    set_state(HostState::Executing).await;
    let ctx = HostContext {
        host: &host,
        session: session.as_deref(),
        output: output.clone(),
    };
    let result = job.run(&ctx).await;

    if let Some(session) = &session {
        if let Err(e) = session.close().await {
            warn!(host = %host.name, error = %e, "Failed to close session");
        }
    }

    finish(&host, &output, result, started_at, &tx).await
}

async fn finish(
    host: &Host,
    output: &HostOutput,
    result: std::result::Result<String, JobFailure>,
    started_at: DateTime<Utc>,
    tx: &mpsc::Sender<FleetEvent>,
) -> HostReport {
    let (state, summary) = match result {
        Ok(summary) => {
            info!(host = %host.name, "Host succeeded");
            output.line(&summary);
            (HostState::Succeeded, summary)
        }
        Err(failure) => {
            error!(host = %host.name, error = %failure.source, "Host failed");
            output.line(&failure.summary);
            let message = failure.source.to_string();
            if message != failure.summary {
                output.line(&message);
            }
            (HostState::Failed { message }, failure.summary)
        }
    };

    let report = HostReport {
        host: host.name.clone(),
        state: state.clone(),
        summary,
        started_at,
        finished_at: Utc::now(),
    };
    let _ = tx
        .send(FleetEvent::HostStateChanged {
            host: host.name.clone(),
            state,
        })
        .await;
    let _ = tx
        .send(FleetEvent::HostCompleted {
            report: report.clone(),
        })
        .await;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use hap_core::{AuthKind, RemoteExit};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn hosts(names: &[&str]) -> BTreeMap<String, Host> {
        names
            .iter()
            .map(|name| {
                let mut host = Host::new(*name);
                host.addr = format!("{}.example:22", name);
                (name.to_string(), host)
            })
            .collect()
    }

    struct MockSession {
        host: Host,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Session for MockSession {
        fn host(&self) -> &Host {
            &self.host
        }

        async fn run(&self, command: &str, output: &HostOutput) -> Result<RemoteExit> {
            output.line(command);
            if command.contains("fail") {
                Ok(RemoteExit {
                    code: Some(1),
                    stderr: "boom".to_string(),
                })
            } else {
                Ok(RemoteExit::success())
            }
        }

        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Refuses hosts whose name starts with `down`.
    #[derive(Default)]
    struct MockTransport {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&self, host: &Host) -> Result<Box<dyn Session>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if host.name.starts_with("down") {
                return Err(Error::Connect {
                    addr: host.addr.clone(),
                    attempted: vec![AuthKind::Agent],
                    message: "connection refused".to_string(),
                });
            }
            Ok(Box::new(MockSession {
                host: host.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    /// Runs `echo {host}`, or a failing command on hosts named `bad*`.
    struct EchoJob;

    #[async_trait]
    impl HostJob for EchoJob {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run(&self, ctx: &HostContext<'_>) -> std::result::Result<String, JobFailure> {
            let command = if ctx.host.name.starts_with("bad") {
                "fail".to_string()
            } else {
                format!("echo {}", ctx.host.name)
            };
            let exit = ctx.session()?.run(&command, &ctx.output).await?;
            if exit.is_success() {
                Ok(format!("`{}` completed.", command))
            } else {
                Err(JobFailure::new(
                    format!("`{}` failed.", command),
                    Error::Exec {
                        code: exit.code,
                        stderr: exit.stderr,
                    },
                ))
            }
        }
    }

    fn orchestrator(transport: Arc<MockTransport>) -> (FleetOrchestrator, LineSink) {
        let sink = LineSink::capture();
        (FleetOrchestrator::new(transport, sink.clone()), sink)
    }

    #[test]
    fn test_host_state_success() {
        assert!(!HostState::Pending.is_success());
        assert!(!HostState::Executing.is_success());
        assert!(HostState::Succeeded.is_success());
        let failed = HostState::Failed {
            message: "x".to_string(),
        };
        assert!(!failed.is_success());
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let transport = Arc::new(MockTransport::default());
        let (orch, sink) = orchestrator(transport.clone());

        let result = orch.run_all(hosts(&["a", "bad", "c"]), Arc::new(EchoJob)).await;

        assert!(!result.success);
        assert!(result.reports["a"].state.is_success());
        assert!(result.reports["c"].state.is_success());
        assert!(matches!(result.reports["bad"].state, HostState::Failed { .. }));
        assert_eq!(result.reports["bad"].summary, "`fail` failed.");

        let lines = sink.lines();
        assert!(lines.contains(&"[a] `echo a` completed.".to_string()));
        assert!(lines.contains(&"[bad] `fail` failed.".to_string()));
        assert!(lines.iter().any(|l| l.starts_with("[bad] remote command exited with status 1")));

        assert_eq!(transport.opened.load(Ordering::SeqCst), 3);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_failure_never_executes() {
        let transport = Arc::new(MockTransport::default());
        let (orch, sink) = orchestrator(transport.clone());

        let (mut rx, handle) = orch.execute(hosts(&["down1", "up"]), Arc::new(EchoJob));
        let mut states: BTreeMap<String, Vec<HostState>> = BTreeMap::new();
        while let Some(event) = rx.recv().await {
            if let FleetEvent::HostStateChanged { host, state } = event {
                states.entry(host).or_default().push(state);
            }
        }
        let result = handle.await.unwrap();

        assert_eq!(
            states["down1"],
            vec![
                HostState::Pending,
                HostState::Connecting,
                HostState::Failed {
                    message: "failed to connect to down1.example:22 (tried agent): connection refused"
                        .to_string()
                },
            ]
        );
        assert_eq!(
            states["up"],
            vec![
                HostState::Pending,
                HostState::Connecting,
                HostState::Executing,
                HostState::Succeeded,
            ]
        );
        assert!(sink.lines().contains(&"[down1] echo failed.".to_string()));
        assert!(!sink.lines().iter().any(|l| l.starts_with("[down1] echo down1")));
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);

        let err = result.into_result().unwrap_err();
        match err {
            Error::PartialFleet(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].name, "down1");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let (orch, _sink) = orchestrator(Arc::new(MockTransport::default()));
        let result = orch.run_all(hosts(&["a", "b"]), Arc::new(EchoJob)).await;
        assert!(result.success);
        let reports = result.into_result().unwrap();
        assert!(reports.values().all(|r| r.finished_at >= r.started_at));
    }

    #[tokio::test]
    async fn test_empty_fleet_succeeds() {
        let (orch, _sink) = orchestrator(Arc::new(MockTransport::default()));
        let result = orch.run_all(BTreeMap::new(), Arc::new(EchoJob)).await;
        assert!(result.success);
        assert!(result.reports.is_empty());
    }

    /// Waits until every host has started, so it only finishes when hosts
    /// run concurrently.
    struct BarrierJob {
        barrier: tokio::sync::Barrier,
    }

    #[async_trait]
    impl HostJob for BarrierJob {
        fn name(&self) -> &str {
            "barrier"
        }

        async fn run(&self, _ctx: &HostContext<'_>) -> std::result::Result<String, JobFailure> {
            self.barrier.wait().await;
            Ok("done".to_string())
        }
    }

    #[tokio::test]
    async fn test_hosts_run_concurrently() {
        let (orch, _sink) = orchestrator(Arc::new(MockTransport::default()));
        let job = Arc::new(BarrierJob {
            barrier: tokio::sync::Barrier::new(4),
        });
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            orch.run_all(hosts(&["a", "b", "c", "d"]), job),
        )
        .await
        .expect("hosts did not run concurrently");
        assert!(result.success);
    }

    /// Records which hosts it saw without a session.
    struct LocalJob {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HostJob for LocalJob {
        fn name(&self) -> &str {
            "local"
        }

        fn requires_session(&self) -> bool {
            false
        }

        async fn run(&self, ctx: &HostContext<'_>) -> std::result::Result<String, JobFailure> {
            assert!(ctx.session.is_none());
            assert!(matches!(ctx.session(), Err(Error::NoSession(_))));
            self.seen.lock().unwrap().push(ctx.host.name.clone());
            Ok("listed.".to_string())
        }
    }

    #[tokio::test]
    async fn test_sessionless_job_skips_transport() {
        let transport = Arc::new(MockTransport::default());
        let (orch, _sink) = orchestrator(transport.clone());
        let job = Arc::new(LocalJob {
            seen: Mutex::new(Vec::new()),
        });
        let result = orch.run_all(hosts(&["down1", "b"]), job.clone()).await;

        assert!(result.success);
        assert_eq!(transport.opened.load(Ordering::SeqCst), 0);
        let mut seen = job.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["b", "down1"]);
    }

    struct PanicJob;

    #[async_trait]
    impl HostJob for PanicJob {
        fn name(&self) -> &str {
            "panic"
        }

        async fn run(&self, ctx: &HostContext<'_>) -> std::result::Result<String, JobFailure> {
            if ctx.host.name == "boom" {
                panic!("job blew up");
            }
            Ok("ok".to_string())
        }
    }

    #[tokio::test]
    async fn test_panicking_host_is_reported_failed() {
        let (orch, _sink) = orchestrator(Arc::new(MockTransport::default()));
        let result = orch.run_all(hosts(&["boom", "fine"]), Arc::new(PanicJob)).await;
        assert!(!result.success);
        assert!(matches!(result.reports["boom"].state, HostState::Failed { .. }));
        assert!(result.reports["fine"].state.is_success());
    }
}
