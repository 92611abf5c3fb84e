//! Destination for lines a script writes through `console` and `print`.

use std::fmt::{self, Display, Formatter};
use std::sync::{Mutex, PoisonError};

use toolbox_primitives::ToolId;
use tracing::{debug, error, info, warn};

/// Severity of a script log line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LogLevel {
    /// `console.debug`.
    Debug,
    /// `console.log`, `console.info`, and `print`.
    Info,
    /// `console.warn`.
    Warn,
    /// `console.error`.
    Error,
}

impl LogLevel {
    /// Returns the lowercase level name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line written by a script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    /// Tool that wrote the line.
    pub tool_id: ToolId,
    /// Severity.
    pub level: LogLevel,
    /// Arguments joined with spaces.
    pub message: String,
}

/// Receives script log lines.
pub trait LogSink: Send + Sync {
    /// Records a line.
    fn log(&self, line: &LogLine);
}

/// Sink that re-emits lines as `tracing` events under the `toolbox::script` target.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, line: &LogLine) {
        match line.level {
            LogLevel::Debug => debug!(target: "toolbox::script", tool_id = %line.tool_id, "{}", line.message),
            LogLevel::Info => info!(target: "toolbox::script", tool_id = %line.tool_id, "{}", line.message),
            LogLevel::Warn => warn!(target: "toolbox::script", tool_id = %line.tool_id, "{}", line.message),
            LogLevel::Error => error!(target: "toolbox::script", tool_id = %line.tool_id, "{}", line.message),
        }
    }
}

/// Sink that keeps every line in memory, for hosts that render a console pane.
#[derive(Debug, Default)]
pub struct CollectingLogSink {
    lines: Mutex<Vec<LogLine>>,
}

impl CollectingLogSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the collected lines.
    #[must_use]
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns the collected lines.
    pub fn drain(&self) -> Vec<LogLine> {
        std::mem::take(&mut *self.lines.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl LogSink for CollectingLogSink {
    fn log(&self, line: &LogLine) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.clone());
    }
}
