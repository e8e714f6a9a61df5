/// Status file: writes the fleet state as JSON on every lifecycle transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::registry::ProcessHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Supervisor states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetState {
    Launching,
    Running,
    ShuttingDown,
}

/// One worker as recorded in the status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub pid: u32,
    pub exited: bool,
}

impl From<&ProcessHandle> for WorkerStatus {
    fn from(handle: &ProcessHandle) -> Self {
        Self {
            name: handle.name().to_string(),
            pid: handle.pid(),
            exited: handle.has_exited(),
        }
    }
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: FleetState,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub workers: Vec<WorkerStatus>,
    pub failed: Vec<String>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    /// Create a new StatusFile writer for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".camfleet.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Builds StatusData for each transition. A tracker without a file is a no-op.
pub struct StatusTracker {
    file: Option<StatusFile>,
    pid: u32,
    started_at: DateTime<Utc>,
    workers: Vec<WorkerStatus>,
    failed: Vec<String>,
}

impl StatusTracker {
    pub fn new(status_path: Option<PathBuf>) -> Self {
        Self {
            file: status_path.map(StatusFile::new),
            pid: std::process::id(),
            started_at: Utc::now(),
            workers: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Record the current handles.
    pub fn set_workers(&mut self, handles: &[ProcessHandle]) {
        self.workers = handles.iter().map(WorkerStatus::from).collect();
    }

    /// Record the names of workers that failed to launch.
    pub fn set_failed(&mut self, names: impl IntoIterator<Item = String>) {
        self.failed = names.into_iter().collect();
    }

    /// Update and write the status file with the given state.
    pub fn update(&self, state: FleetState) {
        let Some(file) = &self.file else {
            return;
        };
        let data = StatusData {
            pid: self.pid,
            state,
            started_at: self.started_at,
            last_update: Utc::now(),
            workers: self.workers.clone(),
            failed: self.failed.clone(),
        };

        if let Err(e) = file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    /// Remove the status file.
    pub fn remove(&self) {
        if let Some(file) = &self.file {
            file.remove();
        }
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}
