//! Terminal output: a spinner while a workload runs and a coloured summary.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use fleetbench::lifecycle::{FlowRecord, RunReport, RunStatus};

pub struct RunProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    pub fn start(workload: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("RUNNING: {workload}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Clears the spinner and prints one line for the run and one per flow.
    pub fn complete(&self, report: &RunReport) {
        self.pb.finish_and_clear();

        let (style, mark) = self.status_style(report.status);
        println!(
            "  {} {} {:?} in {:.1}s ({} metrics, {} cleanup actions)",
            style.apply_to(mark),
            report.workload,
            report.status,
            report.duration_ms as f64 / 1000.0,
            report.metrics_emitted(),
            report.cleanup.executed,
        );
        for flow in &report.flows {
            self.print_flow(flow);
        }
        if let Some(error) = &report.error {
            println!("  {} {error}", self.red.apply_to("error:"));
        }
    }

    fn print_flow(&self, flow: &FlowRecord) {
        let peer = flow.peer.as_deref().unwrap_or("local");
        let last = flow
            .transitions
            .last()
            .map(ToString::to_string)
            .unwrap_or_default();
        let mark = if flow.failed() {
            self.red.apply_to("✗")
        } else if flow.warnings.is_empty() {
            self.green.apply_to("✓")
        } else {
            self.yellow.apply_to("!")
        };
        println!(
            "    {mark} {peer}: {last}, {} metrics, attempt {}",
            flow.metrics_emitted, flow.attempts
        );
        for warning in &flow.warnings {
            println!("      {} {warning}", self.yellow.apply_to("warning:"));
        }
    }

    fn status_style(&self, status: RunStatus) -> (&Style, &'static str) {
        match status {
            RunStatus::Completed => (&self.green, "✓"),
            RunStatus::Degraded | RunStatus::Cancelled => (&self.yellow, "!"),
            RunStatus::Failed => (&self.red, "✗"),
        }
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}
