/// End-of-run summary: which workers launched, which failed, and how the
/// shutdown went, condensed into one status line and an exit code.
use crate::launcher::LaunchError;
use crate::supervisor::ShutdownReport;

#[derive(Debug)]
pub struct RunSummary {
    pub total: usize,
    pub launched: Vec<String>,
    pub failures: Vec<LaunchError>,
    pub shutdown: ShutdownReport,
}

impl RunSummary {
    pub fn new(
        total: usize,
        launched: Vec<String>,
        failures: Vec<LaunchError>,
        shutdown: ShutdownReport,
    ) -> Self {
        Self {
            total,
            launched,
            failures,
            shutdown,
        }
    }

    /// Every worker launched and every exit was observed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.shutdown.all_exits_observed()
    }

    /// 0 on full success, 1 on any launch or join failure.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// One line for the operator.
    pub fn status_line(&self) -> String {
        let mut line = format!("launched {}/{}", self.launched.len(), self.total);
        if !self.launched.is_empty() {
            line.push_str(&format!(" ({})", self.launched.join(", ")));
        }

        if !self.failures.is_empty() {
            let failed: Vec<String> = self
                .failures
                .iter()
                .map(|f| format!("{} ({})", f.name, f.kind))
                .collect();
            line.push_str(&format!("; failed: {}", failed.join(", ")));
        }

        let s = &self.shutdown;
        line.push_str(&format!(
            "; shutdown complete in {:.1}s: {} exited",
            s.elapsed.as_secs_f64(),
            s.exits.len()
        ));
        if !s.force_killed.is_empty() {
            line.push_str(&format!(", {} killed", s.force_killed.len()));
        }
        let errors = s.termination_errors.len() + s.join_errors.len();
        if errors > 0 {
            line.push_str(&format!(", {errors} error(s)"));
        }
        line
    }
}
