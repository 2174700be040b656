use crate::orchestrator::{BuildObserver, BuildSummary, FeatureOutcome, FeatureRecord, StopReason};
use crate::roadmap::Feature;
use crate::ui::icons::{BRANCH, CHECK, CLOCK, CROSS, RETRY, SPARKLE, STOP, WARN};
use crate::workspace::IsolationMode;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Terminal UI for the build loop.
///
/// Two stacked bars: one counting features in the current pass, and a
/// spinner showing what the current attempt is doing.
pub struct BuildUI {
    multi: MultiProgress,
    feature_bar: ProgressBar,
    step_bar: ProgressBar,
    verbose: bool,
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("█▓▒░"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold.dim} {spinner} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn format_secs(secs: f64) -> String {
    let secs = secs.round() as u64;
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

impl BuildUI {
    pub fn new(verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let feature_bar = multi.add(ProgressBar::new(0));
        feature_bar.set_style(bar_style());
        feature_bar.set_prefix("Features");

        let step_bar = multi.add(ProgressBar::new_spinner());
        step_bar.set_style(spinner_style());
        step_bar.set_prefix("    Step");

        Self {
            multi,
            feature_bar,
            step_bar,
            verbose,
        }
    }

    /// Print through the progress renderer, falling back to stderr.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn finish(&self) {
        self.step_bar.finish_and_clear();
        self.feature_bar.finish_and_clear();
    }

    pub fn print_summary(&self, summary: &BuildSummary) {
        self.finish();
        println!();
        println!("{}", style("═".repeat(60)).cyan());
        println!("{}{}", SPARKLE, style("Build summary").bold());
        println!("{}", style("═".repeat(60)).cyan());
        println!(
            "  {} built, {} failed, {} tests, {}{}",
            style(summary.built).green().bold(),
            style(summary.failed).red().bold(),
            summary.total_tests,
            CLOCK,
            format_secs(summary.total_time_secs)
        );
        println!("  Strategy: {}   Model: {}", summary.branch_strategy, summary.model);

        for pass in &summary.passes {
            println!();
            println!("  {} pass", style(pass.mode).bold());
            for record in &pass.features {
                let icon = match record.status {
                    FeatureOutcome::Built => CHECK,
                    FeatureOutcome::Failed => CROSS,
                };
                let mut line = format!(
                    "    {}#{} {} ({} attempt{}, {})",
                    icon,
                    record.id,
                    record.name,
                    record.attempts,
                    if record.attempts == 1 { "" } else { "s" },
                    format_secs(record.duration_secs)
                );
                if let Some(branch) = &record.branch {
                    line.push_str(&format!(" {}", style(branch).dim()));
                }
                println!("{}", line);
                for recovery in &record.recovery {
                    println!("        {}", style(format!("partial work: {}", recovery)).dim());
                }
            }
        }

        if !summary.unschedulable.is_empty() {
            println!();
            println!("  {}Not scheduled:", WARN);
            for u in &summary.unschedulable {
                println!("    #{} {}: {}", u.id, u.name, style(&u.reason).dim());
            }
        }
        if let Some(batch) = &summary.drift_batch {
            let icon = if batch.passed { CHECK } else { CROSS };
            println!();
            println!("  {}Drift batch: {} checked", icon, batch.checked);
            for label in &batch.failed {
                println!("    {}", style(label).red());
            }
        }

        println!();
        match &summary.stop_reason {
            StopReason::Completed => println!("  {}All scheduled features processed", CHECK),
            StopReason::NoFeaturesReady => println!("  {}No features ready", CHECK),
            StopReason::MaxFeatures { limit } => {
                println!("  {}Stopped at the feature limit ({})", STOP, limit)
            }
            StopReason::Interrupted => println!("  {}Interrupted; rerun with --resume to continue", STOP),
            StopReason::Fatal { message } => println!("  {}{}", STOP, style(message).red().bold()),
        }
    }
}

impl BuildObserver for BuildUI {
    fn pass_started(&self, mode: IsolationMode, total: usize) {
        self.feature_bar.reset();
        self.feature_bar.set_length(total as u64);
        self.feature_bar.set_message(format!("{} pass", mode));
        self.print_line(format!("{}{} pass: {} features", BRANCH, style(mode).bold(), total));
    }

    fn feature_started(&self, index: usize, total: usize, feature: &Feature) {
        self.feature_bar
            .set_message(format!("#{} {}", feature.id, style(&feature.name).yellow()));
        self.print_line(format!(
            "\n{} [{}/{}] #{} {}",
            style("▶").cyan(),
            index + 1,
            total,
            feature.id,
            style(&feature.name).bold()
        ));
    }

    fn attempt_started(&self, feature: &Feature, attempt: u32, max: u32) {
        if attempt > 1 {
            self.print_line(format!("    {}Retry {}/{} for {}", RETRY, attempt, max, feature.name));
        }
        self.step_bar.reset_elapsed();
        self.step_bar.set_message(format!("attempt {}/{}: agent running", attempt, max));
        self.step_bar.enable_steady_tick(Duration::from_millis(100));
    }

    fn step(&self, message: &str) {
        self.step_bar.set_message(message.to_string());
        if self.verbose {
            self.print_line(format!("    {} {}", style("→").dim(), style(message).dim()));
        }
    }

    fn feature_finished(&self, record: &FeatureRecord) {
        self.step_bar.disable_steady_tick();
        self.step_bar.set_message("");
        self.feature_bar.inc(1);
        match record.status {
            FeatureOutcome::Built => self.print_line(format!(
                "    {}{} built in {}",
                CHECK,
                style(&record.name).green().bold(),
                format_secs(record.duration_secs)
            )),
            FeatureOutcome::Failed => self.print_line(format!(
                "    {}{} failed: {}",
                CROSS,
                style(&record.name).red().bold(),
                record.failure.as_deref().unwrap_or("unknown")
            )),
        }
        for note in &record.notes {
            self.print_line(format!("    {}{}", WARN, style(note).dim()));
        }
    }
}
