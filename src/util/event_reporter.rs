//! Rate-limited event reporting.
//!
//! High-frequency events (filtered destinations, quota hits) would flood the
//! log at one line each. The reporter logs the first event after an idle
//! period immediately, then folds the rest into a periodic count.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Burst-coalescing log sink for one event kind.
pub struct EventReporter {
    name: &'static str,
    report_interval: Duration,
    state: Mutex<ReporterState>,
}

struct ReporterState {
    pending: u64,
    total: u64,
    last_report: Option<Instant>,
}

impl EventReporter {
    /// Create a reporter emitting at most one line per `report_interval`.
    pub fn new(name: &'static str, report_interval: Duration) -> Self {
        Self {
            name,
            report_interval,
            state: Mutex::new(ReporterState {
                pending: 0,
                total: 0,
                last_report: None,
            }),
        }
    }

    /// Reporter with the default 10-second interval.
    pub fn with_default_interval(name: &'static str) -> Self {
        Self::new(name, Duration::from_secs(10))
    }

    /// Record one event, logging now or deferring into the next report.
    pub fn raise(&self, detail: &str) {
        let mut state = self.state.lock();
        state.total += 1;

        let due = match state.last_report {
            None => true,
            Some(at) => at.elapsed() >= self.report_interval,
        };

        if due {
            let coalesced = state.pending;
            state.pending = 0;
            state.last_report = Some(Instant::now());
            let total = state.total;
            drop(state);

            if coalesced > 0 {
                tracing::info!(
                    event = self.name,
                    coalesced,
                    total,
                    "{}: {} ({} more since last report)",
                    self.name,
                    detail,
                    coalesced
                );
            } else {
                tracing::info!(event = self.name, total, "{}: {}", self.name, detail);
            }
        } else {
            state.pending += 1;
        }
    }

    /// Events recorded so far.
    pub fn total(&self) -> u64 {
        self.state.lock().total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_every_raise() {
        let reporter = EventReporter::new("test", Duration::from_secs(3600));
        for _ in 0..5 {
            reporter.raise("event");
        }
        assert_eq!(reporter.total(), 5);
    }

    #[test]
    fn test_coalesces_within_interval() {
        let reporter = EventReporter::new("test", Duration::from_secs(3600));
        reporter.raise("first"); // logs immediately
        reporter.raise("second"); // coalesced
        reporter.raise("third"); // coalesced

        let state = reporter.state.lock();
        assert_eq!(state.pending, 2);
        assert_eq!(state.total, 3);
    }

    #[test]
    fn test_reports_again_after_interval() {
        let reporter = EventReporter::new("test", Duration::from_millis(0));
        reporter.raise("a");
        reporter.raise("b"); // interval elapsed, logs and resets pending
        assert_eq!(reporter.state.lock().pending, 0);
    }
}
