//! Throttled error reporting for the forwarding path.
//!
//! Per-packet failures must not flood the log, so reports can carry a
//! throttle key. Within one window only the first report per key is emitted;
//! the next emitted report carries the number suppressed in between.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

/// Throttle keys used by the relay and event loop.
pub mod keys {
    pub const HOST_TO_VM_RECORD_BOUNDS: &str = "h2v-record-bounds";
    pub const HOST_TO_VM_WRITE_FAILED: &str = "h2v-write-failed";
    pub const HOST_TO_VM_WRITE_PARTIAL: &str = "h2v-write-partial";
    pub const HOST_TO_VM_EOF: &str = "h2v-eof";
    pub const HOST_TO_VM_READ_FAILED: &str = "h2v-read-failed";
    pub const VM_TO_HOST_WRITE_FAILED: &str = "v2h-write-failed";
    pub const VM_TO_HOST_WRITE_PARTIAL: &str = "v2h-write-partial";
    pub const VM_TO_HOST_EOF: &str = "v2h-eof";
    pub const VM_TO_HOST_READ_FAILED: &str = "v2h-read-failed";
    pub const EVENT_ERROR: &str = "event-error";
    pub const EVENT_NO_ROUTE: &str = "event-no-route";
    pub const POLL_FAILED: &str = "poll-failed";
    pub const MEMBERSHIP_FAILED: &str = "membership-failed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Default)]
struct KeyState {
    last_emit: Option<Instant>,
    suppressed: u64,
    total: u64,
}

/// Error sink shared by all ports and the event loop.
#[derive(Debug)]
pub struct Reporter {
    window: Duration,
    keys: Mutex<HashMap<&'static str, KeyState>>,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_THROTTLE_WINDOW)
    }
}

impl Reporter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Report a condition. Returns whether it was emitted.
    ///
    /// Reports without a key are never throttled.
    pub fn report(
        &self,
        severity: Severity,
        context: &str,
        throttle_key: Option<&'static str>,
        message: fmt::Arguments<'_>,
    ) -> bool {
        let Some(key) = throttle_key else {
            emit(severity, context, "", 0, message);
            return true;
        };

        let suppressed = {
            let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
            let state = keys.entry(key).or_default();
            state.total += 1;

            let now = Instant::now();
            let open = state
                .last_emit
                .is_none_or(|last| now.duration_since(last) >= self.window);
            if !open {
                state.suppressed += 1;
                return false;
            }
            state.last_emit = Some(now);
            std::mem::take(&mut state.suppressed)
        };

        emit(severity, context, key, suppressed, message);
        true
    }

    /// Total reports seen under `key`, emitted or not.
    pub fn count(&self, key: &str) -> u64 {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.get(key).map_or(0, |s| s.total)
    }

    /// Reports under `key` suppressed since the last emitted one.
    pub fn suppressed(&self, key: &str) -> u64 {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.get(key).map_or(0, |s| s.suppressed)
    }
}

fn emit(severity: Severity, context: &str, key: &str, suppressed: u64, message: fmt::Arguments<'_>) {
    match severity {
        Severity::Debug => debug!(context, key, suppressed, "{}", message),
        Severity::Info => info!(context, key, suppressed, "{}", message),
        Severity::Warn => warn!(context, key, suppressed, "{}", message),
        Severity::Error => error!(context, key, suppressed, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_within_window() {
        let reporter = Reporter::new(Duration::from_secs(3600));

        assert!(reporter.report(Severity::Warn, "port0", Some("k"), format_args!("first")));
        assert!(!reporter.report(Severity::Warn, "port0", Some("k"), format_args!("second")));
        assert!(!reporter.report(Severity::Warn, "port0", Some("k"), format_args!("third")));

        assert_eq!(reporter.count("k"), 3);
        assert_eq!(reporter.suppressed("k"), 2);
    }

    #[test]
    fn keys_are_independent() {
        let reporter = Reporter::new(Duration::from_secs(3600));

        assert!(reporter.report(Severity::Error, "a", Some("x"), format_args!("x")));
        assert!(reporter.report(Severity::Error, "a", Some("y"), format_args!("y")));
        assert_eq!(reporter.count("x"), 1);
        assert_eq!(reporter.count("y"), 1);
        assert_eq!(reporter.count("z"), 0);
    }

    #[test]
    fn unkeyed_reports_always_emit() {
        let reporter = Reporter::new(Duration::from_secs(3600));
        for _ in 0..5 {
            assert!(reporter.report(Severity::Info, "ctx", None, format_args!("hello")));
        }
    }

    #[test]
    fn zero_window_never_throttles() {
        let reporter = Reporter::new(Duration::ZERO);
        for _ in 0..3 {
            assert!(reporter.report(Severity::Debug, "ctx", Some("k"), format_args!("msg")));
        }
        assert_eq!(reporter.suppressed("k"), 0);
    }
}
