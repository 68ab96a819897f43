use crate::error::{ErrorReport, GuardError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Bounded in-memory log of recent errors. Oldest entries are dropped when
/// full or once they exceed the retention window.
#[derive(Debug)]
pub struct DiagnosticLog {
    capacity: usize,
    retention: Duration,
    entries: Mutex<VecDeque<ErrorReport>>,
}

impl DiagnosticLog {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Record `error` with optional context and return the stored report.
    pub fn record(&self, error: &GuardError, context: &[(&str, String)]) -> ErrorReport {
        let report = context
            .iter()
            .fold(error.report(), |report, (key, value)| report.with_context(*key, value.clone()));
        log::debug!("Diagnostic {}: {}", report.id, report.to_json());
        self.push(report.clone());
        report
    }

    pub fn push(&self, report: ErrorReport) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        entries.push_back(report);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        Self::prune(&mut entries, self.retention, Utc::now());
    }

    /// Reports still inside the retention window, oldest first.
    pub fn recent(&self) -> Vec<ErrorReport> {
        let Ok(mut entries) = self.entries.lock() else {
            return Vec::new();
        };
        Self::prune(&mut entries, self.retention, Utc::now());
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    fn prune(entries: &mut VecDeque<ErrorReport>, retention: Duration, now: DateTime<Utc>) {
        let Ok(retention) = ChronoDuration::from_std(retention) else {
            return;
        };
        let cutoff = now - retention;
        while entries.front().is_some_and(|r| r.recorded_at < cutoff) {
            entries.pop_front();
        }
    }
}
