//! The closed public error taxonomy.
//!
//! Every way a call can end unsuccessfully maps to exactly one
//! [`PipelineError`] variant: a narrow `thiserror` enum for expected, typed
//! failures, leaving `anyhow` for internal glue that never crosses the
//! public boundary.

use bytes::Bytes;
use thiserror::Error;

use crate::audit::AuditEntry;

/// The closed set of ways a [`crate::pipeline::RequestPipeline`] call can
/// fail, one variant per terminal non-success audit event (§7).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("sniff failed: no nodes could be reached to refresh the pool")]
    SniffFailed {
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("ping failed against node {node_uri}")]
    PingFailed {
        node_uri: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("request rejected before any node was contacted: {message}")]
    BadRequest { message: String },

    #[error("node {node_uri} returned a response the product registration rejected")]
    BadResponse {
        node_uri: String,
        status_code: Option<u16>,
    },

    #[error("exhausted the retry budget ({attempts} attempts) without a known-good response")]
    MaxRetriesReached { attempts: u32 },

    #[error("exceeded the overall request timeout after {attempts} attempt(s)")]
    MaxTimeoutReached { attempts: u32 },

    #[error("the node pool yielded no nodes to attempt this call against")]
    NoNodesAttempted,

    #[error("the call was cancelled")]
    CancellationRequested,

    #[error("failed over across every node in the pool without success")]
    FailedOverAllNodes { attempts: u32 },
}

impl PipelineError {
    /// `true` for the "known error" half of `successOrKnownError` (§4.4.2):
    /// a response the caller should trust and stop retrying on, as opposed
    /// to a transport-level failure worth failing over from.
    pub fn is_known_error(&self) -> bool {
        matches!(self, PipelineError::BadResponse { .. } | PipelineError::BadRequest { .. })
    }

    /// The node this error pertains to, when the failure reached (or tried
    /// to reach) a specific node, so a caller can attach the most recent
    /// `ApiCallDetails` per §4.4.7 instead of reporting no node at all.
    pub fn node_uri(&self) -> Option<&str> {
        match self {
            PipelineError::PingFailed { node_uri, .. } => Some(node_uri),
            PipelineError::BadResponse { node_uri, .. } => Some(node_uri),
            _ => None,
        }
    }

    /// The HTTP status code the last attempt observed, when one was ever
    /// read from a server response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            PipelineError::BadResponse { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

/// The concrete, per-attempt call details attached to both a failed call's
/// exception and a successful call's `onRequestCompleted` notification —
/// the spec's `ApiCallDetails` (§4.4.7, §6.5, §6.6).
///
/// `tcp_states` and `thread_pool_stats` are always `None`: this
/// implementation does not gather either (no OS-level TCP introspection, no
/// thread-pool concept — the Tokio runtime does not expose one the way a
/// bounded thread pool does), but the fields stay on the struct so the debug
/// rendering order matches §6.5 exactly and can be filled in by a future
/// `RequestInvoker` that does gather them.
#[derive(Clone, Debug, Default)]
pub struct ApiCallDetails {
    pub success: bool,
    pub http_status_code: Option<u16>,
    pub node_uri: Option<String>,
    pub request_body_in_bytes: Option<Bytes>,
    pub response_body_in_bytes: Option<Bytes>,
    pub tcp_states: Option<String>,
    pub thread_pool_stats: Option<String>,
}

/// Wraps a [`PipelineError`] together with the full audit trail and whatever
/// endpoint/call details were known at the time of failure, so a caller that
/// wants to log or re-throw has everything without re-deriving it from the
/// pipeline's internals.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct UnexpectedTransportException {
    #[source]
    pub source: PipelineError,
    pub method: http::Method,
    pub path_and_query: String,
    pub audit_trail: Vec<AuditEntry>,
    pub call_details: Option<ApiCallDetails>,
}

impl UnexpectedTransportException {
    pub fn new(
        source: PipelineError,
        method: http::Method,
        path_and_query: impl Into<String>,
        audit_trail: Vec<AuditEntry>,
        call_details: Option<ApiCallDetails>,
    ) -> Self {
        Self {
            source,
            method,
            path_and_query: path_and_query.into(),
            audit_trail,
            call_details,
        }
    }

    /// Ordered debug-information rendering (§6.5): audit trail, original
    /// exception, request body (if buffered), response body (if buffered),
    /// TCP states (if gathered), thread-pool statistics (if gathered).
    pub fn debug_information(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(out, "# audit trail");
        for entry in &self.audit_trail {
            let _ = writeln!(out, "  {:?}", entry);
        }
        let _ = writeln!(out, "# original exception\n{}", self.source);

        if let Some(details) = &self.call_details {
            if let Some(body) = &details.request_body_in_bytes {
                let _ = writeln!(out, "# request body\n{}", String::from_utf8_lossy(body));
            }
            if let Some(body) = &details.response_body_in_bytes {
                let _ = writeln!(out, "# response body\n{}", String::from_utf8_lossy(body));
            }
            if let Some(tcp_states) = &details.tcp_states {
                let _ = writeln!(out, "# tcp states\n{tcp_states}");
            }
            if let Some(stats) = &details.thread_pool_stats {
                let _ = writeln!(out, "# thread-pool statistics\n{stats}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_response_and_bad_request_are_known_errors() {
        assert!(PipelineError::BadRequest { message: "x".into() }.is_known_error());
        assert!(PipelineError::BadResponse {
            node_uri: "http://a:9200/".into(),
            status_code: Some(404)
        }
        .is_known_error());
    }

    #[test]
    fn transport_failures_are_not_known_errors() {
        assert!(!PipelineError::NoNodesAttempted.is_known_error());
        assert!(!PipelineError::MaxRetriesReached { attempts: 3 }.is_known_error());
    }

    #[test]
    fn debug_information_orders_sections_per_spec() {
        let exception = UnexpectedTransportException::new(
            PipelineError::BadResponse {
                node_uri: "http://a:9200/".into(),
                status_code: Some(503),
            },
            http::Method::GET,
            "/_search".into(),
            Vec::new(),
            Some(ApiCallDetails {
                success: false,
                http_status_code: Some(503),
                node_uri: Some("http://a:9200/".into()),
                request_body_in_bytes: Some(Bytes::from_static(b"{\"query\":{}}")),
                response_body_in_bytes: Some(Bytes::from_static(b"{\"error\":\"unavailable\"}")),
                tcp_states: None,
                thread_pool_stats: None,
            }),
        );

        let rendered = exception.debug_information();
        let audit_at = rendered.find("# audit trail").unwrap();
        let exception_at = rendered.find("# original exception").unwrap();
        let request_at = rendered.find("# request body").unwrap();
        let response_at = rendered.find("# response body").unwrap();
        assert!(audit_at < exception_at);
        assert!(exception_at < request_at);
        assert!(request_at < response_at);
        assert!(rendered.contains("unavailable"));
        assert!(!rendered.contains("# tcp states"));
    }
}
