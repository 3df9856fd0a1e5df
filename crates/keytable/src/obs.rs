//! Diagnostics sink boundary.
//!
//! Core read/write logic MUST NOT branch on diagnostics. All
//! instrumentation flows through `DiagnosticEvent` and `DiagnosticsSink`;
//! callers use the sink for testing and observability only.

use crate::plan::PathKind;
use std::fmt;
use std::sync::Mutex;

///
/// DiagnosticEvent
///

#[derive(Clone, Debug)]
pub enum DiagnosticEvent {
    /// Planner selected an access path for a query.
    PlanChosen {
        table: String,
        path: PathKind,
        residual: usize,
    },
    /// A cached result set satisfied the read.
    CacheHit { table: String, fingerprint: String },
    /// No usable cached result set; a rebuild (or fallback) follows.
    CacheMiss { table: String, fingerprint: String },
    /// A rebuild stored a fresh result set into the cache.
    CachePopulated {
        table: String,
        fingerprint: String,
        rows: usize,
        version: u64,
    },
    /// A rebuild finished but a concurrent write intervened; the result
    /// was served without being cached.
    PopulateSkipped { table: String, fingerprint: String },
    /// Write-time invalidation dropped cached result sets.
    CacheInvalidated {
        table: String,
        dropped: usize,
        version: u64,
    },
    /// The cache layer was bypassed for this call.
    DegradedRead {
        table: String,
        reason: DegradedReason,
    },
}

///
/// DegradedReason
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DegradedReason {
    LockTimeout,
    CacheUnavailable,
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::LockTimeout => "lock wait timed out",
            Self::CacheUnavailable => "cache store unavailable",
        };
        write!(f, "{label}")
    }
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlanChosen {
                table,
                path,
                residual,
            } => write!(
                f,
                "table '{table}': chose {path} with {residual} residual condition(s)"
            ),
            Self::CacheHit { table, fingerprint } => {
                write!(f, "table '{table}': cache hit for {fingerprint}")
            }
            Self::CacheMiss { table, fingerprint } => {
                write!(f, "table '{table}': cache miss for {fingerprint}")
            }
            Self::CachePopulated {
                table,
                fingerprint,
                rows,
                version,
            } => write!(
                f,
                "table '{table}': cached {rows} row(s) for {fingerprint} at version {version}"
            ),
            Self::PopulateSkipped { table, fingerprint } => write!(
                f,
                "table '{table}': skipped caching {fingerprint}, write intervened"
            ),
            Self::CacheInvalidated {
                table,
                dropped,
                version,
            } => write!(
                f,
                "table '{table}': invalidated {dropped} result set(s), now at version {version}"
            ),
            Self::DegradedRead { table, reason } => {
                write!(f, "table '{table}': degraded to direct read ({reason})")
            }
        }
    }
}

///
/// DiagnosticsSink
///

pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, event: DiagnosticEvent);
}

///
/// NullSink
/// Default sink; drops every event.
///

#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn record(&self, _: DiagnosticEvent) {}
}

///
/// MemorySink
///
/// Collecting sink for tests and local observability; events are kept in
/// arrival order.
///

#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().expect("sink state").clone()
    }

    #[must_use]
    pub fn count(&self, matcher: impl Fn(&DiagnosticEvent) -> bool) -> usize {
        self.events
            .lock()
            .expect("sink state")
            .iter()
            .filter(|event| matcher(event))
            .count()
    }

    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.count(|e| matches!(e, DiagnosticEvent::CacheHit { .. }))
    }

    #[must_use]
    pub fn cache_misses(&self) -> usize {
        self.count(|e| matches!(e, DiagnosticEvent::CacheMiss { .. }))
    }

    #[must_use]
    pub fn degraded_reads(&self) -> usize {
        self.count(|e| matches!(e, DiagnosticEvent::DegradedRead { .. }))
    }

    pub fn clear(&self) {
        self.events.lock().expect("sink state").clear();
    }
}

impl DiagnosticsSink for MemorySink {
    fn record(&self, event: DiagnosticEvent) {
        self.events.lock().expect("sink state").push(event);
    }
}

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_collects_in_arrival_order() {
        let sink = MemorySink::new();
        sink.record(DiagnosticEvent::CacheMiss {
            table: "books".into(),
            fingerprint: "aa".into(),
        });
        sink.record(DiagnosticEvent::CacheHit {
            table: "books".into(),
            fingerprint: "aa".into(),
        });

        assert_eq!(sink.cache_misses(), 1);
        assert_eq!(sink.cache_hits(), 1);
        let events = sink.events();
        assert!(matches!(events[0], DiagnosticEvent::CacheMiss { .. }));
    }

    #[test]
    fn events_render_human_readable() {
        let event = DiagnosticEvent::DegradedRead {
            table: "books".into(),
            reason: DegradedReason::LockTimeout,
        };
        assert_eq!(
            event.to_string(),
            "table 'books': degraded to direct read (lock wait timed out)"
        );
    }
}
