//! The audit trail: a closed set of pipeline events and the ordered log
//! every call accumulates as it runs.
//!
//! One [`Auditor`] is created per call (per [`crate::pipeline::RequestPipeline`]
//! invocation); it is never shared across calls. Long-running steps (a
//! sniff, a ping, the product call itself) use [`Auditor::scope`], an RAII
//! guard that stamps `ended` on drop regardless of whether the step
//! succeeded, panicked, or was short-circuited by `?`.

use std::fmt;
use std::time::Instant;

use parking_lot::Mutex;

/// The closed set of audit events a pipeline run may emit. Exhaustive by
/// design — exactly these 17 and no others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuditEvent {
    SniffOnStartup,
    SniffOnFail,
    SniffOnStaleCluster,
    SniffSuccess,
    SniffFailure,
    PingSuccess,
    PingFailure,
    Resurrection,
    AllNodesDead,
    BadResponse,
    HealthyResponse,
    MaxTimeoutReached,
    MaxRetriesReached,
    BadRequest,
    NoNodesAttempted,
    CancellationRequested,
    FailedOverAllNodes,
}

impl AuditEvent {
    /// `true` for the events that terminate a pipeline run (§8, invariant 1).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AuditEvent::HealthyResponse
                | AuditEvent::BadResponse
                | AuditEvent::BadRequest
                | AuditEvent::MaxRetriesReached
                | AuditEvent::MaxTimeoutReached
                | AuditEvent::NoNodesAttempted
                | AuditEvent::CancellationRequested
                | AuditEvent::FailedOverAllNodes
        )
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditEvent::SniffOnStartup => "SniffOnStartup",
            AuditEvent::SniffOnFail => "SniffOnFail",
            AuditEvent::SniffOnStaleCluster => "SniffOnStaleCluster",
            AuditEvent::SniffSuccess => "SniffSuccess",
            AuditEvent::SniffFailure => "SniffFailure",
            AuditEvent::PingSuccess => "PingSuccess",
            AuditEvent::PingFailure => "PingFailure",
            AuditEvent::Resurrection => "Resurrection",
            AuditEvent::AllNodesDead => "AllNodesDead",
            AuditEvent::BadResponse => "BadResponse",
            AuditEvent::HealthyResponse => "HealthyResponse",
            AuditEvent::MaxTimeoutReached => "MaxTimeoutReached",
            AuditEvent::MaxRetriesReached => "MaxRetriesReached",
            AuditEvent::BadRequest => "BadRequest",
            AuditEvent::NoNodesAttempted => "NoNodesAttempted",
            AuditEvent::CancellationRequested => "CancellationRequested",
            AuditEvent::FailedOverAllNodes => "FailedOverAllNodes",
        };
        f.write_str(s)
    }
}

/// One entry in the audit trail.
#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub event: AuditEvent,
    /// Redacted node URI this entry pertains to, if any.
    pub node_uri: Option<String>,
    pub started: Instant,
    pub ended: Instant,
    /// Type name of the exception associated with this entry, if any.
    pub exception: Option<String>,
}

/// Appends timestamped audit entries for a single pipeline run, in order.
pub struct Auditor {
    entries: Mutex<Vec<AuditEntry>>,
}

impl Auditor {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Appends an instantaneous entry (`started == ended == now`).
    pub fn emit(&self, event: AuditEvent, node_uri: Option<String>) {
        let now = Instant::now();
        self.entries.lock().push(AuditEntry {
            event,
            node_uri,
            started: now,
            ended: now,
            exception: None,
        });
    }

    /// Appends an instantaneous entry carrying an exception type name.
    pub fn emit_with_exception(
        &self,
        event: AuditEvent,
        node_uri: Option<String>,
        exception: impl Into<String>,
    ) {
        let now = Instant::now();
        self.entries.lock().push(AuditEntry {
            event,
            node_uri,
            started: now,
            ended: now,
            exception: Some(exception.into()),
        });
    }

    /// Opens a scope for a long-running step. The returned guard stamps
    /// `ended` on drop; call [`AuditScope::fail`] before dropping to attach
    /// an exception type name, or just drop it to record success.
    pub fn scope(&self, event: AuditEvent, node_uri: Option<String>) -> AuditScope<'_> {
        AuditScope {
            auditor: self,
            event,
            node_uri,
            started: Instant::now(),
            exception: None,
        }
    }

    /// Returns a snapshot copy of the entries recorded so far.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// `true` iff the trail's last entry is a terminal event, satisfying
    /// invariant 1 of §8 (exactly one terminal event per call).
    pub fn has_terminal_entry(&self) -> bool {
        self.entries
            .lock()
            .last()
            .is_some_and(|e| e.event.is_terminal())
    }
}

impl Default for Auditor {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a long-running audited step. Stamps `ended = now()` on
/// drop so a step that returns early via `?` still gets a correctly timed
/// audit entry.
pub struct AuditScope<'a> {
    auditor: &'a Auditor,
    event: AuditEvent,
    node_uri: Option<String>,
    started: Instant,
    exception: Option<String>,
}

impl<'a> AuditScope<'a> {
    /// Attaches an exception type name to this scope's entry.
    pub fn fail(&mut self, exception: impl Into<String>) {
        self.exception = Some(exception.into());
    }

    /// Overrides the event recorded when the scope ends, e.g. switching
    /// from `HealthyResponse` to `BadResponse` once the response status is
    /// known.
    pub fn set_event(&mut self, event: AuditEvent) {
        self.event = event;
    }
}

impl<'a> Drop for AuditScope<'a> {
    fn drop(&mut self) {
        let entry = AuditEntry {
            event: self.event,
            node_uri: self.node_uri.take(),
            started: self.started,
            ended: Instant::now(),
            exception: self.exception.take(),
        };
        self.auditor.entries.lock().push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_appended_in_order() {
        let auditor = Auditor::new();
        auditor.emit(AuditEvent::SniffOnStartup, None);
        auditor.emit(AuditEvent::PingSuccess, Some("http://a:9200/".into()));
        let entries = auditor.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, AuditEvent::SniffOnStartup);
        assert_eq!(entries[1].event, AuditEvent::PingSuccess);
    }

    #[test]
    fn scope_stamps_ended_on_drop() {
        let auditor = Auditor::new();
        {
            let _scope = auditor.scope(AuditEvent::HealthyResponse, None);
        }
        let entries = auditor.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ended >= entries[0].started);
    }

    #[test]
    fn terminal_event_detection() {
        let auditor = Auditor::new();
        auditor.emit(AuditEvent::SniffOnStartup, None);
        assert!(!auditor.has_terminal_entry());
        auditor.emit(AuditEvent::HealthyResponse, None);
        assert!(auditor.has_terminal_entry());
    }
}
