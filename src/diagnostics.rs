//! Error and diagnostics reporting.
//!
//! Cache-internal failures (disk read errors, broken invariants, torn-down
//! fills) are never surfaced to callers; they are resolved to miss-shaped
//! results and reported here instead.  The reporter is an explicit
//! dependency handed to the cache manager at construction, so tests can
//! observe reports without ambient globals.

use prometheus_client::metrics::counter::Counter;
use tracing::{debug, error, warn};

/// Details attached to a single diagnostics report.
#[derive(Debug, Default)]
pub struct Report {
    pub message: String,
    /// Capture and log a backtrace alongside the report.
    pub trace: bool,
    /// Page-worthy: bumps the alarm counter in addition to logging.
    pub alarm: bool,
    /// Structured context for the log event.
    pub extra: Option<serde_json::Value>,
}

/// Clonable sink for `(category, report)` pairs.
#[derive(Clone)]
pub struct ErrorReporter {
    alarms: Counter,
}

impl ErrorReporter {
    pub fn new(alarms: Counter) -> Self {
        Self { alarms }
    }

    /// Emit a report.  Alarmed reports log at error level and increment
    /// the alarm counter; everything else logs at warn level.
    pub fn report(&self, category: &str, report: Report) {
        let extra = report
            .extra
            .map(|v| v.to_string())
            .unwrap_or_default();

        if report.alarm {
            self.alarms.inc();
            error!(%category, message = %report.message, extra = %extra, "diagnostics report");
        } else {
            warn!(%category, message = %report.message, extra = %extra, "diagnostics report");
        }

        if report.trace {
            let backtrace = std::backtrace::Backtrace::force_capture();
            debug!(%category, %backtrace, "diagnostics report backtrace");
        }
    }
}
