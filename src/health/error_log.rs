//! Bounded rolling log of operator-relevant errors.
//!
//! Every failure that surfaces anywhere in the engine lands here exactly
//! once, tagged with a severity; the health aggregator reads the log to
//! score recent error pressure. Oldest entries are evicted at capacity.

use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Fatal,
}

impl Severity {
    pub fn name(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub at_epoch_s: u64,
    pub severity: Severity,
    /// Subsystem that reported the condition.
    pub source: &'static str,
    pub detail: String,
}

pub struct ErrorLog {
    entries: Mutex<VecDeque<ErrorEntry>>,
    capacity: usize,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, severity: Severity, source: &'static str, detail: impl Into<String>) {
        let detail = detail.into();
        match severity {
            Severity::Info => debug!("[{source}] {detail}"),
            Severity::Warning => warn!("[{source}] {detail}"),
            Severity::Critical | Severity::Fatal => error!("[{source}] {detail}"),
        }

        let entry = ErrorEntry {
            at_epoch_s: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            severity,
            source,
            detail,
        };
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<ErrorEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// True while any Fatal entry is in the rolling window.
    pub fn has_fatal(&self) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.severity == Severity::Fatal)
    }

    /// (warning, critical, fatal) counts in the window.
    pub fn severity_counts(&self) -> (usize, usize, usize) {
        let entries = self.entries.lock();
        let count = |s: Severity| entries.iter().filter(|e| e.severity == s).count();
        (
            count(Severity::Warning),
            count(Severity::Critical),
            count(Severity::Fatal),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded_and_evicts_oldest() {
        let log = ErrorLog::new(3);
        for i in 0..5 {
            log.record(Severity::Info, "test", format!("entry {i}"));
        }
        let entries = log.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].detail, "entry 2");
    }

    #[test]
    fn fatal_detection_tracks_the_window() {
        let log = ErrorLog::new(2);
        log.record(Severity::Fatal, "boiler", "overtemp");
        assert!(log.has_fatal());
        // Two more entries push the fatal out of the bounded window.
        log.record(Severity::Info, "test", "a");
        log.record(Severity::Info, "test", "b");
        assert!(!log.has_fatal());
    }

    #[test]
    fn severity_counts_split_by_level() {
        let log = ErrorLog::new(16);
        log.record(Severity::Warning, "test", "w");
        log.record(Severity::Warning, "test", "w");
        log.record(Severity::Critical, "test", "c");
        assert_eq!(log.severity_counts(), (2, 1, 0));
    }
}
