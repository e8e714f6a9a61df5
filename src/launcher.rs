/// Fleet launch: one tokio task ("launch unit") per worker command.
///
/// Each unit spawns its process, registers the handle, reports the start
/// result back to `launch_all`, and then spends the rest of its life waiting
/// on the process's exit. Signals from the supervisor are delivered by the
/// unit itself, between waits, while the child is known to be unreaped.
use crate::command::CommandSpec;
use crate::registry::{HandleRegistry, ProcessHandle};
use crate::terminate;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

/// Why a worker could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchErrorKind {
    /// The executable does not exist.
    NotFound,
    /// The executable exists but may not be run.
    PermissionDenied,
    /// Any other OS failure, e.g. process or file descriptor limits.
    Os,
    /// The launch unit ended without registering a handle.
    Aborted,
}

impl std::fmt::Display for LaunchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LaunchErrorKind::NotFound => "executable not found",
            LaunchErrorKind::PermissionDenied => "permission denied",
            LaunchErrorKind::Os => "OS error",
            LaunchErrorKind::Aborted => "launch aborted",
        };
        f.write_str(s)
    }
}

/// A worker that failed to start. Identifies the offending command.
#[derive(Debug)]
pub struct LaunchError {
    pub index: usize,
    pub name: String,
    pub program: String,
    pub kind: LaunchErrorKind,
    pub source: Option<std::io::Error>,
}

impl LaunchError {
    fn from_spawn(index: usize, spec: &CommandSpec, source: std::io::Error) -> Self {
        let kind = match source.kind() {
            std::io::ErrorKind::NotFound => LaunchErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => LaunchErrorKind::PermissionDenied,
            _ => LaunchErrorKind::Os,
        };
        Self {
            index,
            name: spec.name().to_string(),
            program: spec.program().to_string(),
            kind,
            source: Some(source),
        }
    }

    fn aborted(index: usize, spec: &CommandSpec) -> Self {
        Self {
            index,
            name: spec.name().to_string(),
            program: spec.program().to_string(),
            kind: LaunchErrorKind::Aborted,
            source: None,
        }
    }
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to launch {} ({}): {}",
            self.name, self.program, self.kind
        )?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// What a launch unit observed when its process ended.
#[derive(Debug)]
pub struct WorkerExit {
    pub index: usize,
    pub name: String,
    pub pid: u32,
    /// `Err` if the OS could not report the exit status.
    pub status: std::io::Result<ExitStatus>,
    /// Time from spawn to observed exit.
    pub runtime: Duration,
}

/// Output of the launch phase.
#[derive(Debug)]
pub struct Launch {
    /// Sealed registry: one handle per successfully started command.
    pub registry: Arc<HandleRegistry>,
    /// One entry per command that did not start, in command order.
    pub failures: Vec<LaunchError>,
    /// Launch units still waiting on their processes. Units for failed
    /// commands complete with `None`.
    pub units: JoinSet<Option<WorkerExit>>,
}

impl Launch {
    /// Number of workers that started.
    #[cfg(test)]
    pub fn launched(&self) -> usize {
        self.registry.len()
    }
}

/// Start every command concurrently and return once each has either
/// registered a handle or reported a `LaunchError`.
///
/// Started processes keep running after this returns; their launch units
/// live in `Launch::units` until the processes exit.
pub async fn launch_all(specs: &[CommandSpec]) -> Launch {
    let registry = Arc::new(HandleRegistry::new());
    let mut units = JoinSet::new();
    let mut pending = Vec::with_capacity(specs.len());

    for (index, spec) in specs.iter().enumerate() {
        let (started_tx, started_rx) = oneshot::channel();
        units.spawn(launch_unit(
            index,
            spec.clone(),
            Arc::clone(&registry),
            started_tx,
        ));
        pending.push((index, started_rx));
    }

    let mut failures = Vec::new();
    for (index, started_rx) in pending {
        match started_rx.await {
            Ok(Ok(_pid)) => {}
            Ok(Err(e)) => {
                tracing::error!(index = e.index, error = %e, "worker launch failed");
                failures.push(e);
            }
            Err(_) => {
                let e = LaunchError::aborted(index, &specs[index]);
                tracing::error!(error = %e, "launch unit ended before reporting");
                failures.push(e);
            }
        }
    }

    registry.seal();
    tracing::info!(
        launched = registry.len(),
        failed = failures.len(),
        total = specs.len(),
        "launch phase complete"
    );

    Launch {
        registry,
        failures,
        units,
    }
}

async fn launch_unit(
    index: usize,
    spec: CommandSpec,
    registry: Arc<HandleRegistry>,
    started: oneshot::Sender<Result<u32, LaunchError>>,
) -> Option<WorkerExit> {
    let mut command = Command::new(spec.program());
    command
        .args(spec.args())
        // The supervisor owns the terminal's stdin for the stop prompt.
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        // Own process group: a terminal Ctrl-C reaches only the supervisor.
        .process_group(0);
    if let Some(cwd) = spec.cwd() {
        command.current_dir(cwd);
    }

    tracing::info!(name = %spec.name(), command = %spec, "launching worker");
    let start = Instant::now();

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = started.send(Err(LaunchError::from_spawn(index, &spec, e)));
            return None;
        }
    };

    let Some(pid) = child.id() else {
        let _ = child.wait().await;
        let _ = started.send(Err(LaunchError::aborted(index, &spec)));
        return None;
    };

    let exited = Arc::new(AtomicBool::new(false));
    let (control, mut requests) = mpsc::unbounded_channel();
    let handle = ProcessHandle::new(index, spec.name(), pid, Arc::clone(&exited), control);
    if let Err(rejected) = registry.append(handle) {
        // Unregistered workers would never be terminated, so stop this one now.
        tracing::warn!(pid, name = %spec.name(), reason = %rejected, "handle rejected, killing worker");
        let _ = child.start_kill();
        let _ = child.wait().await;
        let _ = started.send(Err(LaunchError::aborted(index, &spec)));
        return None;
    }

    tracing::info!(pid, name = %spec.name(), "worker started");
    let _ = started.send(Ok(pid));

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(request) = requests.recv() => {
                let delivery = terminate::send(pid, request.signal);
                tracing::debug!(pid, name = %spec.name(), signal = %request.signal, ?delivery, "signal delivered");
                let _ = request.reply.send(delivery);
            }
        }
    };
    exited.store(true, Ordering::Release);
    // Requests queued behind the exit are answered as `Gone` on drop.
    drop(requests);
    let runtime = start.elapsed();

    match &status {
        Ok(s) => tracing::info!(
            pid,
            name = %spec.name(),
            status = %s,
            runtime_secs = runtime.as_secs(),
            "worker exited"
        ),
        Err(e) => tracing::warn!(
            pid,
            name = %spec.name(),
            error = %e,
            "failed to observe worker exit"
        ),
    }

    Some(WorkerExit {
        index,
        name: spec.name().to_string(),
        pid,
        status,
        runtime,
    })
}
