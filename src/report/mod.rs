//! Result reporting: console summaries and JUnit export.
//!
//! An `indicatif::ProgressBar` plus `console`-styled pass/fail lines,
//! driven by a live view over the orchestrator's running
//! [`crate::model::StatusSnapshot`] rather than fixed batch callbacks.

pub mod junit;

pub use junit::write_junit_report;

use crate::model::{AllocationStatus, StatusSnapshot, TestResult};

/// Live terminal progress indicator, incremented once per terminal result.
/// There is no discovery phase to announce, since submission and dispatch
/// are decoupled and the total test count can grow after the bar is
/// created.
pub struct ConsoleProgress {
    bar: indicatif::ProgressBar,
}

impl ConsoleProgress {
    pub fn new(total: u64) -> Self {
        let bar = indicatif::ProgressBar::new(total);
        bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar }
    }

    pub fn set_total(&self, total: u64) {
        self.bar.set_length(total);
    }

    /// Reports one terminal result, printing a colored PASS/FAIL/TIME/CANC
    /// line above the bar.
    pub fn report_terminal(&self, result: &TestResult) {
        self.bar.inc(1);
        let label = match result.status {
            AllocationStatus::Completed => console::style("PASS").green(),
            AllocationStatus::Failed => console::style("FAIL").red(),
            AllocationStatus::TimedOut => console::style("TIME").red().bold(),
            AllocationStatus::Cancelled => console::style("CANC").yellow(),
            _ => console::style("????").dim(),
        };
        self.bar.println(format!("{label} {}", result.test_id));
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Prints a final human-readable summary.
pub fn print_summary(snapshot: &StatusSnapshot) {
    println!();
    println!("Status:");
    println!("  Queued:    {}", snapshot.queued_count);
    println!("  Active:    {}", console::style(snapshot.active_count).cyan());
    println!("  Completed: {}", console::style(snapshot.completed_count).green());
    println!("  Failed:    {}", console::style(snapshot.failed_count).red());
    println!("  Timed out: {}", console::style(snapshot.timed_out_count).yellow());
    println!("  Cancelled: {}", snapshot.cancelled_count);

    let mut failing: Vec<_> = snapshot
        .per_test_status
        .iter()
        .filter(|(_, s)| matches!(s, AllocationStatus::Failed | AllocationStatus::TimedOut))
        .collect();
    failing.sort_by(|a, b| a.0.cmp(b.0));

    if failing.is_empty() {
        if snapshot.failed_count == 0 && snapshot.timed_out_count == 0 {
            println!();
            println!("{}", console::style("All tests passed.").green().bold());
        }
        return;
    }

    println!();
    println!("{}", console::style("Failing tests:").red().bold());
    for (test_id, status) in failing {
        println!("  - {test_id} ({status:?})");
    }
}
