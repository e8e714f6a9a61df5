/// Stop trigger for the supervisor's wait phase.
///
/// Several equivalent sources feed one wait: a line on stdin, SIGINT or
/// SIGTERM to the supervisor, a STOP file appearing on disk, an optional
/// maximum runtime, and a programmatic `CancellationToken`. Whichever fires
/// first ends the wait. Stdin EOF is not a trigger, so headless runs with
/// stdin closed keep going until signalled.
///
/// SIGINT/SIGTERM handlers are installed by `ShutdownSignals::install`
/// before any worker starts. Workers live in their own process groups, so
/// the supervisor must never die to a default signal action.
use crate::config::ShutdownConfig;
use std::future::pending;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Which source ended the wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The operator pressed Enter.
    OperatorInput,
    /// The supervisor received a shutdown signal.
    Signal(&'static str),
    /// The stop file appeared.
    StopFile(PathBuf),
    /// `max_runtime` elapsed.
    Timeout(Duration),
    /// `CancellationToken::cancel` was called.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::OperatorInput => write!(f, "operator input"),
            StopReason::Signal(name) => write!(f, "{name}"),
            StopReason::StopFile(path) => write!(f, "stop file {}", path.display()),
            StopReason::Timeout(d) => write!(f, "max runtime of {}s reached", d.as_secs()),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// SIGINT and SIGTERM listeners for the supervisor process.
///
/// Once installed, the default terminate action no longer applies. Signals
/// received before `recv` is first polled are not lost.
#[derive(Debug)]
pub struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    pub async fn recv(&mut self) -> StopReason {
        tokio::select! {
            Some(()) = self.sigint.recv() => StopReason::Signal("SIGINT"),
            Some(()) = self.sigterm.recv() => StopReason::Signal("SIGTERM"),
            else => pending().await,
        }
    }
}

/// Waits for exactly one stop request from any enabled source.
#[derive(Debug, Clone)]
pub struct StopTrigger {
    token: CancellationToken,
    stdin: bool,
    signals: Option<Arc<Mutex<ShutdownSignals>>>,
    stop_file: Option<PathBuf>,
    poll_interval: Duration,
    max_runtime: Option<Duration>,
}

impl StopTrigger {
    /// A trigger with only the programmatic source enabled.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            stdin: false,
            signals: None,
            stop_file: None,
            poll_interval: Duration::from_millis(500),
            max_runtime: None,
        }
    }

    /// Build a trigger from the `[shutdown]` config section.
    pub fn from_config(config: &ShutdownConfig) -> Self {
        Self {
            token: CancellationToken::new(),
            stdin: config.stdin,
            signals: None,
            stop_file: config.stop_file.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            max_runtime: config.max_runtime_secs.map(Duration::from_secs),
        }
    }

    /// Stop on SIGINT/SIGTERM caught by `signals`.
    pub fn with_signals(mut self, signals: ShutdownSignals) -> Self {
        self.signals = Some(Arc::new(Mutex::new(signals)));
        self
    }

    #[cfg(test)]
    pub fn with_stop_file(mut self, path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        self.stop_file = Some(path.into());
        self.poll_interval = poll_interval;
        self
    }

    #[cfg(test)]
    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = Some(max_runtime);
        self
    }

    /// Whether an Enter keypress will stop the fleet.
    pub fn accepts_operator_input(&self) -> bool {
        self.stdin
    }

    /// Token that fires the trigger when cancelled.
    #[cfg(test)]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Block until one source fires. No timeout unless `max_runtime` is set.
    pub async fn wait(&self) -> StopReason {
        let reason = tokio::select! {
            _ = self.token.cancelled() => StopReason::Cancelled,
            reason = operator_input(), if self.stdin => reason,
            reason = caught_signal(self.signals.as_deref()), if self.signals.is_some() => reason,
            reason = stop_file(self.stop_file.as_deref(), self.poll_interval), if self.stop_file.is_some() => reason,
            reason = deadline(self.max_runtime), if self.max_runtime.is_some() => reason,
        };
        tracing::info!(reason = %reason, "stop requested");
        reason
    }
}

impl Default for StopTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve on the first line of stdin; never resolve on EOF.
///
/// The read runs on a plain thread: a blocking stdin read inside the tokio
/// runtime would hold up runtime shutdown until the next keypress.
async fn operator_input() -> StopReason {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        if let Ok(n) = std::io::stdin().read_line(&mut line) {
            if n > 0 {
                let _ = tx.send(());
            }
        }
    });
    match rx.await {
        Ok(()) => StopReason::OperatorInput,
        Err(_) => {
            tracing::debug!("stdin closed, operator stop disabled");
            pending().await
        }
    }
}

async fn caught_signal(signals: Option<&Mutex<ShutdownSignals>>) -> StopReason {
    match signals {
        Some(signals) => signals.lock().await.recv().await,
        None => pending().await,
    }
}

/// Poll for the stop file. It is removed once seen so the next run starts
/// cleanly.
async fn stop_file(path: Option<&Path>, poll_interval: Duration) -> StopReason {
    let Some(path) = path else {
        return pending().await;
    };
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        ticker.tick().await;
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(error = %e, path = %path.display(), "failed to remove stop file");
            }
            return StopReason::StopFile(path.to_path_buf());
        }
    }
}

async fn deadline(max_runtime: Option<Duration>) -> StopReason {
    match max_runtime {
        Some(d) => {
            tokio::time::sleep(d).await;
            StopReason::Timeout(d)
        }
        None => pending().await,
    }
}
