//! Trace correlation and the trace-keyed logging sink.
//!
//! Every Step, Session and Chain spawned for one logical request carries the
//! same [`TraceContext`]. Log lines emitted through [`trace_log!`] are tagged
//! with it so a request can be followed across cooperating steps.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::Level;
use uuid::Uuid;

/// Opaque id correlating everything that belongs to one request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceContext(String);

impl TraceContext {
    /// Create a fresh trace id
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an id received from upstream (e.g. a request header)
    pub fn from_id(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source location captured at the logging call site
#[derive(Debug, Clone, Copy)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
}

/// Emit one log line keyed by trace context.
///
/// `tracing` macros need a constant level, so the runtime level is matched
/// onto the five fixed callsites here.
pub fn log_event(trace: &TraceContext, level: Level, location: Location, args: fmt::Arguments<'_>) {
    let trace_id = trace.as_str();
    let (file, line) = (location.file, location.line);
    match level {
        Level::ERROR => tracing::error!(trace_id, file, line, "{}", args),
        Level::WARN => tracing::warn!(trace_id, file, line, "{}", args),
        Level::INFO => tracing::info!(trace_id, file, line, "{}", args),
        Level::DEBUG => tracing::debug!(trace_id, file, line, "{}", args),
        _ => tracing::trace!(trace_id, file, line, "{}", args),
    }
}

/// Log a formatted message tagged with a trace context and the caller's location.
///
/// ```ignore
/// trace_log!(chain.trace(), WARN, "chain {} timed out after {:?}", name, timeout);
/// ```
#[macro_export]
macro_rules! trace_log {
    ($trace:expr, $level:ident, $($arg:tt)+) => {
        $crate::trace::log_event(
            $trace,
            ::tracing::Level::$level,
            $crate::trace::Location { file: file!(), line: line!() },
            format_args!($($arg)+),
        )
    };
}
