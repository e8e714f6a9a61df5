mod command;
mod config;
mod launcher;
mod registry;
mod report;
mod signals;
mod status;
mod supervisor;
mod terminate;

use clap::Parser;
use config::{ConfigError, FleetConfig};
use launcher::Launch;
use report::RunSummary;
use signals::{ShutdownSignals, StopTrigger};
use status::{FleetState, StatusTracker};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use supervisor::{Supervisor, TerminationPolicy};
use tracing_subscriber::EnvFilter;

/// Launch every worker in a deployment file, wait for a stop trigger
/// (Enter, SIGINT/SIGTERM, a stop file, or a max runtime), then terminate
/// the workers and wait until each has exited.
#[derive(Parser, Debug)]
#[command(name = "camfleet", version, about)]
pub struct Cli {
    /// Positional parameters, substituted into worker args as {1}, {2}, ...
    #[arg(value_name = "PARAMS")]
    params: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "camfleet.toml")]
    config: PathBuf,

    /// Don't stop on Enter (overrides config)
    #[arg(long)]
    no_stdin: bool,

    /// Stop when this file appears (overrides config)
    #[arg(long, value_name = "PATH")]
    stop_file: Option<PathBuf>,

    /// SIGKILL workers still running this many seconds after SIGTERM (overrides config)
    #[arg(long, value_name = "SECS")]
    grace_period: Option<u64>,

    /// Stop after this many seconds (overrides config)
    #[arg(long, value_name = "SECS")]
    max_runtime: Option<u64>,

    /// JSON status file path (overrides config)
    #[arg(long, value_name = "PATH")]
    status_file: Option<PathBuf>,

    /// Validate config and print the resolved commands, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (signal delivery, config details)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings, errors and the final status line
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut FleetConfig) {
        if self.no_stdin {
            config.shutdown.stdin = false;
        }
        if let Some(path) = &self.stop_file {
            config.shutdown.stop_file = Some(path.clone());
        }
        if let Some(secs) = self.grace_period {
            config.shutdown.grace_period_secs = Some(secs);
        }
        if let Some(secs) = self.max_runtime {
            config.shutdown.max_runtime_secs = Some(secs);
        }
        if let Some(path) = &self.status_file {
            config.supervisor.status_file = Some(path.clone());
        }
    }

    fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "not starting");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<u8, ConfigError> {
    let mut config = config::load(&cli.config)?;
    cli.apply_overrides(&mut config);
    let specs = config.command_specs(&cli.params)?;

    if cli.dry_run {
        println!("camfleet v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        for spec in &specs {
            match spec.cwd() {
                Some(cwd) => println!("  {}: {} (in {})", spec.name(), spec, cwd.display()),
                None => println!("  {}: {}", spec.name(), spec),
            }
        }
        println!("Dry run mode: config validated, not running.");
        return Ok(0);
    }

    // Before any worker starts: a SIGINT from here on must shut the fleet
    // down rather than kill the supervisor and orphan detached workers.
    let mut trigger = StopTrigger::from_config(&config.shutdown);
    match ShutdownSignals::install() {
        Ok(signals) => trigger = trigger.with_signals(signals),
        Err(e) => tracing::warn!(error = %e, "failed to install SIGINT/SIGTERM handlers"),
    }
    let policy = TerminationPolicy {
        grace_period: config.shutdown.grace_period_secs.map(Duration::from_secs),
    };

    let mut status = StatusTracker::new(config.supervisor.status_file.clone());
    status.update(FleetState::Launching);

    let Launch {
        registry,
        failures,
        units,
    } = launcher::launch_all(&specs).await;
    status.set_failed(failures.iter().map(|f| f.name.clone()));

    let handles = registry.snapshot();
    let launched: Vec<String> = handles.iter().map(|h| h.name().to_string()).collect();
    let mut supervisor = Supervisor::new(handles, units, policy).with_status(status);

    let report = if launched.is_empty() {
        tracing::error!("no worker launched, nothing to supervise");
        supervisor.shutdown().await
    } else {
        if trigger.accepts_operator_input() {
            println!("Press Enter to stop ...");
        }
        supervisor.run(&trigger).await
    };

    let summary = RunSummary::new(specs.len(), launched, failures, report);
    println!("{}", summary.status_line());
    if let Some(reason) = &summary.shutdown.reason {
        println!("Stopped ({reason}).");
    } else {
        println!("Stopped.");
    }
    Ok(summary.exit_code())
}
