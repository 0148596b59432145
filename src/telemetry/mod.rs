use std::io::IsTerminal;

use crate::channels::errors::ErrorEvent;
use crate::event_bus::Event;

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta / dark pink
pub const RESET_COLOR: &str = "\x1b[0m";

/// Whether a [`PlainFormatter`] includes ANSI color codes in its output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FormatterMode {
    /// Colors on if stderr is a TTY, off otherwise (operator console vs. a
    /// redirected log file).
    #[default]
    Auto,
    /// Always include ANSI color codes.
    Colored,
    /// Never include ANSI color codes.
    Plain,
}

impl FormatterMode {
    fn colors_enabled(self) -> bool {
        match self {
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
            FormatterMode::Auto => std::io::stderr().is_terminal(),
        }
    }
}

/// Rendered output for a telemetry item that can be consumed by sinks.
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
    fn render_event(&self, event: &Event) -> EventRender;
    fn render_errors(&self, errors: &[ErrorEvent]) -> Vec<EventRender>;
}

/// Renders events and error chains as human-readable text, with optional
/// ANSI coloring controlled by [`FormatterMode`].
pub struct PlainFormatter {
    mode: FormatterMode,
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl PlainFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: FormatterMode::default(),
        }
    }

    #[must_use]
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self { mode }
    }

    fn colorize(&self, color: &str, text: &str) -> String {
        if self.mode.colors_enabled() {
            format!("{color}{text}{RESET_COLOR}")
        } else {
            text.to_string()
        }
    }
}

fn format_error_chain(
    fmt: &PlainFormatter,
    error: &crate::channels::errors::LadderError,
    indent: usize,
) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(cause) = &error.cause {
        let indent_str = "  ".repeat(indent);
        lines.push(format!(
            "{}\n",
            fmt.colorize(LINE_COLOR, &format!("{indent_str}cause: {}", cause.message))
        ));
        lines.extend(format_error_chain(fmt, cause, indent + 1));
    }
    lines
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> EventRender {
        let line = format!("{}\n", self.colorize(LINE_COLOR, &event.to_string()));
        EventRender {
            context: event.scope_label().map(|s| s.to_string()),
            lines: vec![line],
        }
    }

    fn render_errors(&self, errors: &[ErrorEvent]) -> Vec<EventRender> {
        errors
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let mut lines = Vec::new();
                let scope_str = self.colorize(CONTEXT_COLOR, &format!("{:?}", e.scope));
                lines.push(format!("[{}] {} | {}\n", i, e.when, scope_str));
                lines.push(format!(
                    "{}\n",
                    self.colorize(LINE_COLOR, &format!("  error: {}", e.error.message))
                ));
                lines.extend(format_error_chain(self, &e.error, 1));
                if !e.tags.is_empty() {
                    lines.push(format!(
                        "{}\n",
                        self.colorize(LINE_COLOR, &format!("  tags: {:?}", e.tags))
                    ));
                }
                if !e.context.is_null() {
                    lines.push(format!(
                        "{}\n",
                        self.colorize(LINE_COLOR, &format!("  context: {}", e.context))
                    ));
                }
                EventRender {
                    context: Some(format!("{:?}", e.scope)),
                    lines,
                }
            })
            .collect()
    }
}
