use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use edgeup_updater::{RunObserver, RunOutcome, RunState};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn output_style(force_plain: bool) -> OutputStyle {
    if force_plain || !std::io::stdout().is_terminal() {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let (badge, badge_style) = status_badge(status);
            format!("{} {message}", colorize(badge_style, badge))
        }
    }
}

pub(crate) fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

fn status_badge(status: &str) -> (&'static str, Style) {
    match status {
        "ok" => (
            "[OK]",
            Style::new()
                .fg_color(Some(AnsiColor::BrightGreen.into()))
                .effects(Effects::BOLD),
        ),
        "warn" => (
            "[WARN]",
            Style::new()
                .fg_color(Some(AnsiColor::BrightYellow.into()))
                .effects(Effects::BOLD),
        ),
        "err" => (
            "[ERR]",
            Style::new()
                .fg_color(Some(AnsiColor::BrightRed.into()))
                .effects(Effects::BOLD),
        ),
        _ => ("[..]", Style::new().effects(Effects::DIMMED)),
    }
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn state_label(state: RunState) -> &'static str {
    match state {
        RunState::Idle => "starting",
        RunState::CheckingUpdate => "checking for update",
        RunState::UpToDate => "up to date",
        RunState::UpdateAvailable => "update available",
        RunState::Fetching => "downloading assets",
        RunState::Verifying => "verifying checksums",
        RunState::Unpacking => "unpacking",
        RunState::Swapping => "swapping installation",
        RunState::HealthChecking => "waiting for health",
        RunState::Promoted => "promoted",
        RunState::RollingBack => "rolling back",
        RunState::RolledBack => "rolled back",
        RunState::Aborted => "aborted",
    }
}

/// Spinner naming the current orchestrator state. Draws to stdout so it does
/// not interleave with log output on stderr.
pub(crate) struct StateSpinner {
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl StateSpinner {
    pub(crate) fn start(style: OutputStyle) -> Self {
        let progress_bar = if style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new_spinner();
            progress_bar.set_draw_target(ProgressDrawTarget::stdout());
            if let Ok(spinner) =
                ProgressStyle::with_template("{spinner:.cyan.bold} {msg:<22} {elapsed_precise}")
            {
                progress_bar.set_style(spinner.tick_chars("<^>v "));
            }
            progress_bar.set_message(state_label(RunState::Idle));
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        Self {
            progress_bar,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl RunObserver for StateSpinner {
    fn on_transition(&self, _from: RunState, to: RunState) {
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.set_message(state_label(to));
        }
    }

    fn on_outcome(&self, _outcome: &RunOutcome) {
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.finish_and_clear();
        }
    }
}

pub(crate) fn format_outcome_lines(
    outcome: &RunOutcome,
    style: OutputStyle,
    elapsed: Option<Duration>,
) -> Vec<String> {
    let mut lines = Vec::new();
    match outcome {
        RunOutcome::Skipped => lines.push(render_status_line(
            style,
            "warn",
            "another run is in progress; skipped",
        )),
        RunOutcome::UpToDate { installed, latest } => {
            let message = if installed == latest {
                format!("up to date at {installed}")
            } else {
                format!("keeping {installed}; latest {latest} is older")
            };
            lines.push(render_status_line(style, "ok", &message));
        }
        RunOutcome::Promoted { from, to } => {
            let message = match from {
                Some(from) => format!("promoted {to} (was {from})"),
                None => format!("installed {to}"),
            };
            lines.push(render_status_line(style, "ok", &message));
        }
        RunOutcome::RolledBack {
            attempted,
            cause,
            prior_healthy,
        } => {
            lines.push(render_status_line(
                style,
                "warn",
                &format!("rolled back {attempted}: {cause}"),
            ));
            if *prior_healthy == Some(false) {
                lines.push(render_status_line(
                    style,
                    "err",
                    "restored release is not reporting healthy",
                ));
            }
        }
        RunOutcome::Aborted { state, error } => {
            lines.push(render_status_line(
                style,
                "err",
                &format!("aborted during {state}: {}", error.display_chain()),
            ));
            if outcome.requires_operator() {
                lines.push(render_status_line(
                    style,
                    "err",
                    "operator attention required before the next run",
                ));
            }
        }
    }

    let mut summary = format!(
        "result: {} (exit {})",
        outcome.status(),
        outcome.exit_code()
    );
    if let (OutputStyle::Rich, Some(elapsed)) = (style, elapsed) {
        summary.push_str(&format!(" in {}", format_elapsed(elapsed)));
    }
    lines.push(summary);
    lines
}
