/// Supervision of a launched fleet: wait for the stop trigger, then
/// terminate every worker and join every launch unit.
///
/// Termination is fan-out then fan-in: SIGTERM goes to every live worker
/// before any join is awaited, so workers shut down in parallel. With a
/// grace period configured, workers still running when it elapses get
/// SIGKILL; without one, the join waits for as long as the workers take.
use crate::launcher::WorkerExit;
use crate::registry::ProcessHandle;
use crate::signals::{StopReason, StopTrigger};
use crate::status::{FleetState, StatusTracker};
use crate::terminate::Delivery;
use nix::sys::signal::Signal;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// How hard to push workers that ignore SIGTERM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// Escalate to SIGKILL after this long. `None` waits indefinitely.
    pub grace_period: Option<Duration>,
}

/// A signal could not be delivered to one worker.
#[derive(Debug)]
pub struct TerminationError {
    pub name: String,
    pub pid: u32,
    pub signal: Signal,
    pub source: nix::Error,
}

impl std::fmt::Display for TerminationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to send {} to {} (pid {}): {}",
            self.signal, self.name, self.pid, self.source
        )
    }
}

impl std::error::Error for TerminationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// A worker's exit could not be observed.
#[derive(Debug)]
pub enum JoinError {
    /// The OS wait call failed.
    Wait {
        name: String,
        pid: u32,
        source: std::io::Error,
    },
    /// The launch unit itself failed (panicked or was cancelled).
    Task { source: tokio::task::JoinError },
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::Wait { name, pid, source } => {
                write!(f, "failed to observe exit of {name} (pid {pid}): {source}")
            }
            JoinError::Task { source } => write!(f, "launch unit failed: {source}"),
        }
    }
}

impl std::error::Error for JoinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JoinError::Wait { source, .. } => Some(source),
            JoinError::Task { source } => Some(source),
        }
    }
}

/// Everything one shutdown pass did.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// What ended the wait phase, if the pass came from `run`.
    pub reason: Option<StopReason>,
    /// Workers sent SIGTERM.
    pub signalled: Vec<String>,
    /// Workers that were already gone when termination was requested.
    pub already_exited: Vec<String>,
    /// Workers sent SIGKILL after the grace period.
    pub force_killed: Vec<String>,
    pub termination_errors: Vec<TerminationError>,
    pub join_errors: Vec<JoinError>,
    /// Observed exits, in command order.
    pub exits: Vec<WorkerExit>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// True when every launch unit was joined and reported an exit status.
    pub fn all_exits_observed(&self) -> bool {
        self.join_errors.is_empty()
    }
}

/// Owns the launch units and a read-only snapshot of the registry.
pub struct Supervisor {
    handles: Vec<ProcessHandle>,
    units: JoinSet<Option<WorkerExit>>,
    policy: TerminationPolicy,
    status: StatusTracker,
}

impl Supervisor {
    /// `handles` should be a snapshot of the sealed registry and `units`
    /// the launch units that own the matching waits.
    pub fn new(
        handles: Vec<ProcessHandle>,
        units: JoinSet<Option<WorkerExit>>,
        policy: TerminationPolicy,
    ) -> Self {
        Self {
            handles,
            units,
            policy,
            status: StatusTracker::new(None),
        }
    }

    /// Report lifecycle transitions through `status`.
    pub fn with_status(mut self, status: StatusTracker) -> Self {
        self.status = status;
        self
    }

    /// Handles not yet retired by a completed shutdown.
    #[cfg(test)]
    pub fn handles(&self) -> &[ProcessHandle] {
        &self.handles
    }

    /// Wait for the trigger, then shut the fleet down.
    pub async fn run(&mut self, trigger: &StopTrigger) -> ShutdownReport {
        self.status.set_workers(&self.handles);
        self.status.update(FleetState::Running);
        tracing::info!(workers = self.handles.len(), "supervising, waiting for stop trigger");
        let reason = trigger.wait().await;
        let mut report = self.shutdown().await;
        report.reason = Some(reason);
        report
    }

    /// Terminate every live worker and join every launch unit.
    ///
    /// Safe to call more than once: later calls find nothing left to do.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let start = Instant::now();
        let mut report = ShutdownReport::default();
        self.status.set_workers(&self.handles);
        self.status.update(FleetState::ShuttingDown);

        tracing::info!(workers = self.handles.len(), "shutting down workers");
        for handle in &self.handles {
            if handle.has_exited() {
                tracing::debug!(pid = handle.pid(), name = %handle.name(), "worker already exited");
                report.already_exited.push(handle.name().to_string());
                continue;
            }
            match handle.signal(Signal::SIGTERM).await {
                Ok(Delivery::Sent) => {
                    tracing::debug!(
                        index = handle.index(),
                        pid = handle.pid(),
                        name = %handle.name(),
                        "sent SIGTERM"
                    );
                    report.signalled.push(handle.name().to_string());
                }
                Ok(Delivery::Gone) => {
                    tracing::debug!(pid = handle.pid(), name = %handle.name(), "worker vanished before SIGTERM");
                    report.already_exited.push(handle.name().to_string());
                }
                Err(e) => {
                    let err = TerminationError {
                        name: handle.name().to_string(),
                        pid: handle.pid(),
                        signal: Signal::SIGTERM,
                        source: e,
                    };
                    tracing::warn!(error = %err, "termination request failed");
                    report.termination_errors.push(err);
                }
            }
        }

        self.join_units(&mut report).await;

        // Reaped workers and workers whose unit is gone are retired.
        self.handles.retain(ProcessHandle::is_live);
        report.exits.sort_by_key(|e| e.index);
        report.elapsed = start.elapsed();
        self.status.remove();

        tracing::info!(
            exited = report.exits.len(),
            signalled = report.signalled.len(),
            force_killed = report.force_killed.len(),
            errors = report.termination_errors.len() + report.join_errors.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "shutdown complete"
        );
        report
    }

    async fn join_units(&mut self, report: &mut ShutdownReport) {
        let mut kill_at = self
            .policy
            .grace_period
            .map(|grace| tokio::time::Instant::now() + grace);

        loop {
            let joined = match kill_at {
                Some(at) => {
                    let next = tokio::time::timeout_at(at, self.units.join_next()).await;
                    match next {
                        Ok(joined) => joined,
                        Err(_) => {
                            self.escalate(report).await;
                            kill_at = None;
                            continue;
                        }
                    }
                }
                None => self.units.join_next().await,
            };

            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok(Some(exit)) => match exit.status {
                    Ok(_) => {
                        tracing::debug!(
                            name = %exit.name,
                            runtime_secs = exit.runtime.as_secs_f64(),
                            "worker joined"
                        );
                        report.exits.push(exit);
                    }
                    Err(source) => {
                        let err = JoinError::Wait {
                            name: exit.name,
                            pid: exit.pid,
                            source,
                        };
                        tracing::warn!(error = %err, "join failed");
                        report.join_errors.push(err);
                    }
                },
                // Unit of a worker that never started.
                Ok(None) => {}
                Err(source) => {
                    let err = JoinError::Task { source };
                    tracing::warn!(error = %err, "join failed");
                    report.join_errors.push(err);
                }
            }
        }
    }

    async fn escalate(&self, report: &mut ShutdownReport) {
        tracing::warn!(
            grace_secs = self.policy.grace_period.map(|g| g.as_secs_f64()),
            "grace period elapsed, killing remaining workers"
        );
        for handle in self.handles.iter().filter(|h| h.is_live()) {
            match handle.signal(Signal::SIGKILL).await {
                Ok(Delivery::Sent) => {
                    tracing::warn!(pid = handle.pid(), name = %handle.name(), "sent SIGKILL");
                    report.force_killed.push(handle.name().to_string());
                }
                Ok(Delivery::Gone) => {}
                Err(e) => {
                    let err = TerminationError {
                        name: handle.name().to_string(),
                        pid: handle.pid(),
                        signal: Signal::SIGKILL,
                        source: e,
                    };
                    tracing::warn!(error = %err, "kill request failed");
                    report.termination_errors.push(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSpec;
    use crate::launcher::{launch_all, Launch, LaunchErrorKind};
    use crate::signals::ShutdownSignals;
    use nix::sys::signal::kill;
    use nix::unistd::getpid;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn spec(argv: &[&str]) -> CommandSpec {
        CommandSpec::from_argv(argv).unwrap()
    }

    fn supervise(launch: Launch, policy: TerminationPolicy) -> Supervisor {
        let Launch {
            registry, units, ..
        } = launch;
        Supervisor::new(registry.snapshot(), units, policy)
    }

    fn exit_signal(exit: &WorkerExit) -> Option<i32> {
        exit.status.as_ref().unwrap().signal()
    }

    async fn wait_for_files(paths: &[&Path]) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !paths.iter().all(|p| p.exists()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("workers should install their traps");
    }

    async fn wait_until_exited(handle: &ProcessHandle) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.has_exited() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker should exit on its own");
    }

    #[tokio::test]
    async fn test_short_lived_worker_with_immediate_trigger() {
        let launch = launch_all(&[spec(&["echo", "hi"])]).await;
        assert_eq!(launch.launched(), 1);
        let mut supervisor = supervise(launch, TerminationPolicy::default());

        let trigger = StopTrigger::new();
        trigger.cancellation_token().cancel();
        let report = tokio::time::timeout(Duration::from_secs(5), supervisor.run(&trigger))
            .await
            .unwrap();

        assert_eq!(report.reason, Some(StopReason::Cancelled));
        assert!(report.termination_errors.is_empty());
        assert!(report.all_exits_observed());
        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.signalled.len() + report.already_exited.len(), 1);
    }

    #[tokio::test]
    async fn test_already_exited_worker_is_not_signalled() {
        let launch = launch_all(&[spec(&["echo", "hi"])]).await;
        let mut supervisor = supervise(launch, TerminationPolicy::default());
        wait_until_exited(&supervisor.handles()[0]).await;

        let report = supervisor.shutdown().await;
        assert!(report.signalled.is_empty());
        assert_eq!(report.already_exited, vec!["echo"]);
        assert!(report.termination_errors.is_empty());
        assert_eq!(report.exits.len(), 1);
        assert!(report.exits[0].status.as_ref().unwrap().success());
    }

    #[tokio::test]
    async fn test_long_running_workers_terminate_in_parallel() {
        let launch = launch_all(&[spec(&["sleep", "100"]), spec(&["sleep", "100"])]).await;
        assert_eq!(launch.launched(), 2);
        let mut supervisor = supervise(launch, TerminationPolicy::default());

        let trigger = StopTrigger::new();
        let token = trigger.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(10), supervisor.run(&trigger))
            .await
            .unwrap();

        assert_eq!(report.signalled, vec!["sleep", "sleep"]);
        assert_eq!(report.exits.len(), 2);
        for exit in &report.exits {
            assert_eq!(exit_signal(exit), Some(Signal::SIGTERM as i32));
        }
        assert!(report.elapsed < Duration::from_secs(5));
        assert!(supervisor.handles().is_empty());
    }

    #[tokio::test]
    async fn test_slow_exiting_workers_are_terminated_concurrently() {
        // Each worker takes about a second to exit after SIGTERM. Signalling
        // both before joining either keeps the total near one exit latency.
        let dir = tempfile::tempdir().unwrap();
        let ready: Vec<_> = (0..2).map(|i| dir.path().join(format!("ready{i}"))).collect();
        let specs: Vec<CommandSpec> = ready
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let script = format!(
                    "trap 'sleep 1; exit 0' TERM; touch '{}'; while :; do sleep 0.1; done",
                    path.display()
                );
                spec(&["sh", "-c", &script]).with_name(format!("slow{i}"))
            })
            .collect();

        let launch = launch_all(&specs).await;
        assert_eq!(launch.launched(), 2);
        wait_for_files(&[&ready[0], &ready[1]]).await;

        let mut supervisor = supervise(launch, TerminationPolicy::default());
        let report = tokio::time::timeout(Duration::from_secs(10), supervisor.shutdown())
            .await
            .unwrap();

        assert_eq!(report.signalled, vec!["slow0", "slow1"]);
        assert_eq!(report.exits.len(), 2);
        for exit in &report.exits {
            assert!(exit.status.as_ref().unwrap().success());
        }
        assert!(report.elapsed >= Duration::from_secs(1));
        assert!(
            report.elapsed < Duration::from_millis(1800),
            "shutdown took {:?}, workers were terminated one after another",
            report.elapsed
        );
    }

    #[tokio::test]
    async fn test_signal_caught_during_launch_shuts_fleet_down() {
        let signals = ShutdownSignals::install().unwrap();
        let trigger = StopTrigger::new().with_signals(signals);

        // Arrives before the wait phase starts listening.
        kill(getpid(), Signal::SIGINT).unwrap();
        let launch = launch_all(&[spec(&["sleep", "100"]).with_name("cam")]).await;
        let mut supervisor = supervise(launch, TerminationPolicy::default());

        let report = tokio::time::timeout(Duration::from_secs(10), supervisor.run(&trigger))
            .await
            .unwrap();

        assert_eq!(report.reason, Some(StopReason::Signal("SIGINT")));
        assert_eq!(report.signalled, vec!["cam"]);
        assert_eq!(exit_signal(&report.exits[0]), Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_partial_launch_failure_still_terminates_valid_worker() {
        let launch = launch_all(&[
            spec(&["/nonexistent/camfleet-cam"]),
            spec(&["sleep", "100"]).with_name("valid"),
        ])
        .await;
        assert_eq!(launch.failures.len(), 1);
        assert_eq!(launch.failures[0].kind, LaunchErrorKind::NotFound);
        assert_eq!(launch.launched(), 1);

        let mut supervisor = supervise(launch, TerminationPolicy::default());
        let report = tokio::time::timeout(Duration::from_secs(10), supervisor.shutdown())
            .await
            .unwrap();

        assert_eq!(report.signalled, vec!["valid"]);
        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.exits[0].name, "valid");
        assert_eq!(exit_signal(&report.exits[0]), Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_second_shutdown_is_a_no_op() {
        let launch = launch_all(&[spec(&["sleep", "100"])]).await;
        let mut supervisor = supervise(launch, TerminationPolicy::default());

        let first = supervisor.shutdown().await;
        assert_eq!(first.exits.len(), 1);

        let second = tokio::time::timeout(Duration::from_secs(1), supervisor.shutdown())
            .await
            .unwrap();
        assert!(second.signalled.is_empty());
        assert!(second.already_exited.is_empty());
        assert!(second.exits.is_empty());
        assert!(second.termination_errors.is_empty());
        assert!(second.join_errors.is_empty());
    }

    #[tokio::test]
    async fn test_handle_without_launch_unit_is_treated_as_exited() {
        // pid 1 must never be signalled: no unit owns it.
        let (control, requests) = mpsc::unbounded_channel();
        drop(requests);
        let ghost = ProcessHandle::new(0, "ghost", 1, Arc::new(AtomicBool::new(false)), control);
        let mut supervisor = Supervisor::new(vec![ghost], JoinSet::new(), TerminationPolicy::default());
        let report = supervisor.shutdown().await;

        assert_eq!(report.already_exited, vec!["ghost"]);
        assert!(report.termination_errors.is_empty());
        assert!(supervisor.handles().is_empty());
    }

    #[tokio::test]
    async fn test_crashed_unit_handle_is_retired() {
        let (control, requests) = mpsc::unbounded_channel();
        let ghost = ProcessHandle::new(0, "ghost", 1, Arc::new(AtomicBool::new(false)), control);
        let mut units: JoinSet<Option<WorkerExit>> = JoinSet::new();
        units.spawn(async move {
            let _requests = requests;
            if true {
                panic!("launch unit crashed");
            }
            None
        });
        let mut supervisor = Supervisor::new(vec![ghost], units, TerminationPolicy::default());

        let first = supervisor.shutdown().await;
        assert_eq!(first.join_errors.len(), 1);
        assert!(supervisor.handles().is_empty());

        let second = supervisor.shutdown().await;
        assert!(second.signalled.is_empty());
        assert!(second.termination_errors.is_empty());
    }

    #[tokio::test]
    async fn test_grace_period_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let script = format!("trap '' TERM; touch '{}'; exec sleep 100", ready.display());
        let launch = launch_all(&[spec(&["sh", "-c", &script]).with_name("stubborn")]).await;

        wait_for_files(&[&ready]).await;

        let policy = TerminationPolicy {
            grace_period: Some(Duration::from_millis(300)),
        };
        let mut supervisor = supervise(launch, policy);
        let report = tokio::time::timeout(Duration::from_secs(10), supervisor.shutdown())
            .await
            .unwrap();

        assert_eq!(report.signalled, vec!["stubborn"]);
        assert_eq!(report.force_killed, vec!["stubborn"]);
        assert_eq!(exit_signal(&report.exits[0]), Some(Signal::SIGKILL as i32));
        assert!(report.elapsed >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_grace_period_unused_when_workers_comply() {
        let launch = launch_all(&[spec(&["sleep", "100"])]).await;
        let policy = TerminationPolicy {
            grace_period: Some(Duration::from_secs(5)),
        };
        let mut supervisor = supervise(launch, policy);
        let report = supervisor.shutdown().await;

        assert!(report.force_killed.is_empty());
        assert!(report.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_crashed_launch_unit_is_a_join_error() {
        let mut units: JoinSet<Option<WorkerExit>> = JoinSet::new();
        units.spawn(async {
            if true {
                panic!("launch unit crashed");
            }
            None
        });
        let mut supervisor = Supervisor::new(Vec::new(), units, TerminationPolicy::default());
        let report = supervisor.shutdown().await;

        assert_eq!(report.join_errors.len(), 1);
        assert!(matches!(report.join_errors[0], JoinError::Task { .. }));
        assert!(!report.all_exits_observed());
    }

    #[tokio::test]
    async fn test_status_file_tracks_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camfleet.status");
        let launch = launch_all(&[spec(&["sleep", "100"]).with_name("cam")]).await;
        let mut supervisor = supervise(launch, TerminationPolicy::default())
            .with_status(StatusTracker::new(Some(path.clone())));

        let trigger = StopTrigger::new();
        let token = trigger.cancellation_token();
        let watched = path.clone();
        let observer = tokio::spawn(async move {
            loop {
                if let Ok(contents) = std::fs::read_to_string(&watched) {
                    let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
                    if parsed["state"] == "running" {
                        token.cancel();
                        return parsed;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let report = tokio::time::timeout(Duration::from_secs(10), supervisor.run(&trigger))
            .await
            .unwrap();
        let running = observer.await.unwrap();

        assert_eq!(running["workers"][0]["name"], "cam");
        assert_eq!(report.exits.len(), 1);
        assert!(!path.exists(), "status file is removed after shutdown");
    }

    #[test]
    fn test_termination_error_display() {
        let err = TerminationError {
            name: "oak".to_string(),
            pid: 4242,
            signal: Signal::SIGTERM,
            source: nix::errno::Errno::EPERM,
        };
        let msg = err.to_string();
        assert!(msg.contains("SIGTERM"));
        assert!(msg.contains("oak"));
        assert!(msg.contains("4242"));
    }
}
