use crate::command::{expand_placeholders, CommandSpec, UnresolvedPlaceholder};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from a deployment file (camfleet.toml).
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub supervisor: SupervisorConfig,
    pub shutdown: ShutdownConfig,
    #[serde(rename = "worker")]
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SupervisorConfig {
    /// JSON status file rewritten on each lifecycle transition.
    pub status_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Stop on a line of operator input.
    pub stdin: bool,
    /// Stop when this file appears.
    pub stop_file: Option<PathBuf>,
    pub poll_interval_ms: u64,
    /// Stop after this long even without a trigger.
    pub max_runtime_secs: Option<u64>,
    /// SIGKILL workers still running this long after SIGTERM.
    /// Unset means wait for them indefinitely.
    pub grace_period_secs: Option<u64>,
}

/// One `[[worker]]` entry.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stdin: true,
            stop_file: None,
            poll_interval_ms: 500,
            max_runtime_secs: None,
            grace_period_secs: None,
        }
    }
}

/// Errors from loading or resolving a deployment file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
    MissingParam {
        worker: String,
        source: UnresolvedPlaceholder,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
            ConfigError::MissingParam { worker, source } => {
                write!(f, "worker {worker}: {source}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
            ConfigError::MissingParam { source, .. } => Some(source),
        }
    }
}

/// Load and validate a deployment file.
pub fn load(path: &Path) -> Result<FleetConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: FleetConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.validate()?;
    tracing::debug!(path = %path.display(), workers = config.workers.len(), "config loaded");
    Ok(config)
}

impl FleetConfig {
    /// Check structural rules that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[worker]] is required".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for (i, worker) in self.workers.iter().enumerate() {
            if worker.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "worker #{} has an empty command",
                    i + 1
                )));
            }
            if let Some(name) = &worker.name {
                if !names.insert(name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate worker name {name:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve every worker into a `CommandSpec`, substituting `{N}` with
    /// the N-th positional parameter.
    pub fn command_specs(&self, params: &[String]) -> Result<Vec<CommandSpec>, ConfigError> {
        self.workers
            .iter()
            .map(|worker| worker.command_spec(params))
            .collect()
    }
}

impl WorkerConfig {
    fn command_spec(&self, params: &[String]) -> Result<CommandSpec, ConfigError> {
        let label = self.name.clone().unwrap_or_else(|| self.command.clone());
        let expand = |s: &str| {
            expand_placeholders(s, params).map_err(|e| ConfigError::MissingParam {
                worker: label.clone(),
                source: e,
            })
        };

        let program = expand(self.command.as_str())?;
        let args = self
            .args
            .iter()
            .map(|a| expand(a.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut spec = CommandSpec::new(program, args)
            .map_err(|e| ConfigError::Invalid(format!("worker {label}: {e}")))?;
        if let Some(name) = &self.name {
            spec = spec.with_name(name);
        }
        if let Some(cwd) = &self.cwd {
            spec = spec.with_cwd(cwd);
        }
        Ok(spec)
    }
}
