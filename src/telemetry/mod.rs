//! Rendering of run events and assertion verdicts for human consumption,
//! plus tracing setup for embedding applications.

use crate::assertions::Verdict;
use crate::event_bus::RunEvent;
use std::io::IsTerminal;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a tracing subscriber suited to engine logs.
///
/// Honors `RUST_LOG`; defaults to warnings globally and info for this
/// crate. Call once at process start; a second call is a no-op because the
/// global subscriber is already set.
pub fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn,gauntlet=info"))
        .expect("static filter directive parses");

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .try_init();
}

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta
pub const RESET_COLOR: &str = "\x1b[0m";

/// Formatter color mode for telemetry output.
///
/// - [`FormatterMode::Auto`]: detect TTY capability via `stderr.is_terminal()`
/// - [`FormatterMode::Colored`]: always include color codes
/// - [`FormatterMode::Plain`]: never include color codes (for logs/files)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatterMode {
    #[default]
    Auto,
    Colored,
    Plain,
}

impl FormatterMode {
    /// Auto-detect based on stderr TTY capability.
    pub fn auto_detect() -> Self {
        if std::io::stderr().is_terminal() {
            FormatterMode::Colored
        } else {
            FormatterMode::Plain
        }
    }

    /// True when this mode should use colored output. `Auto` performs TTY
    /// detection on each call.
    pub fn is_colored(&self) -> bool {
        match self {
            FormatterMode::Auto => std::io::stderr().is_terminal(),
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
        }
    }
}

/// Rendered output for a telemetry item, consumable by sinks.
#[derive(Clone, Debug, Default)]
pub struct EventRender {
    pub context: Option<String>,
    pub lines: Vec<String>,
}

impl EventRender {
    pub fn join_lines(&self) -> String {
        self.lines.join("")
    }
}

pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &RunEvent) -> EventRender;
    fn render_verdicts(&self, verdicts: &[Verdict]) -> Vec<EventRender>;
}

/// Plain text formatter with optional ANSI color codes.
pub struct PlainFormatter {
    mode: FormatterMode,
}

impl PlainFormatter {
    /// Formatter with auto-detected color mode.
    pub fn new() -> Self {
        Self {
            mode: FormatterMode::Auto,
        }
    }

    /// Formatter with an explicit color mode.
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self { mode }
    }

    fn color<'a>(&self, ansi_code: &'a str) -> &'a str {
        if self.mode.is_colored() { ansi_code } else { "" }
    }

    fn reset(&self) -> &str {
        if self.mode.is_colored() { RESET_COLOR } else { "" }
    }
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &RunEvent) -> EventRender {
        let line = if self.mode.is_colored() {
            format!("{LINE_COLOR}{event}{RESET_COLOR}\n")
        } else {
            format!("{event}\n")
        };
        EventRender {
            context: Some(event.kind().to_string()),
            lines: vec![line],
        }
    }

    fn render_verdicts(&self, verdicts: &[Verdict]) -> Vec<EventRender> {
        verdicts
            .iter()
            .map(|v| {
                let mark = if v.passed { "PASS" } else { "FAIL" };
                let mut lines = vec![format!(
                    "[{mark}] {}{}{} on {} ({})\n",
                    self.color(CONTEXT_COLOR),
                    v.assertion_id,
                    self.reset(),
                    v.target,
                    v.kind
                )];
                lines.push(format!(
                    "{}  expected: {} | actual: {}{}\n",
                    self.color(LINE_COLOR),
                    v.expected,
                    v.actual,
                    self.reset()
                ));
                if !v.detail.is_empty() {
                    lines.push(format!(
                        "{}  detail: {}{}\n",
                        self.color(LINE_COLOR),
                        v.detail,
                        self.reset()
                    ));
                }
                EventRender {
                    context: Some(v.assertion_id.clone()),
                    lines,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionMode;

    #[test]
    fn plain_mode_renders_without_ansi_codes() {
        let formatter = PlainFormatter::with_mode(FormatterMode::Plain);
        let render = formatter.render_event(&RunEvent::RunStarted {
            run_id: "run-1".into(),
            graph_id: "g1".into(),
            mode: ExecutionMode::Normal,
            seed: 9,
        });
        let text = render.join_lines();
        assert!(!text.contains("\x1b["));
        assert!(text.contains("run-1"));
        assert!(text.contains("seed=9"));
    }

    #[test]
    fn verdict_render_marks_pass_and_fail() {
        let formatter = PlainFormatter::with_mode(FormatterMode::Plain);
        let verdicts = vec![Verdict {
            assertion_id: "a1".into(),
            target: "n1".into(),
            kind: "equals".into(),
            passed: false,
            expected: "1".into(),
            actual: "2".into(),
            detail: "value does not equal expected".into(),
        }];
        let rendered = formatter.render_verdicts(&verdicts);
        assert!(rendered[0].join_lines().contains("[FAIL]"));
    }
}
