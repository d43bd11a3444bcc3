//! The request pipeline: the per-call state machine that turns a logical
//! `(method, path, body)` into a response, orchestrating bootstrap sniffing,
//! stale-cluster and connection-failure sniffing, pinging, the product
//! call, failover across the pool's view, and finalization (§4.4).
//!
//! One [`RequestPipeline`] is constructed per call; it owns its own
//! [`Auditor`] and is never reused or shared across calls, matching the
//! spec's "each call has its own pipeline instance" scheduling model.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditEvent, Auditor};
use crate::clock::Clock;
use crate::config::{BoundConfiguration, RequestCompletedCallback, RequestData, RequestDataCallback};
use crate::endpoint::Endpoint;
use crate::error::{ApiCallDetails, PipelineError, UnexpectedTransportException};
use crate::invoker::{InvokerResponse, RequestInvoker};
use crate::meta;
use crate::node::Node;
use crate::pool::NodePool;
use crate::product::{ProductRegistration, StatusClass};
use crate::serializer::Serializer;

/// Request body as the pipeline sees it. Serialization to bytes happens at
/// call time (not construction time), via the transport's shared
/// `Serializer`.
#[derive(Clone, Debug)]
pub enum RequestBody {
    Bytes(Bytes),
    Json(serde_json::Value),
    None,
}

/// The shared, immutable collaborators every pipeline for a given
/// `Transport` is built from. Cheap to clone (everything is an `Arc`).
pub struct PipelineContext {
    pub pool: Arc<NodePool>,
    pub product: Arc<dyn ProductRegistration>,
    pub invoker: Arc<dyn RequestInvoker>,
    pub serializer: Arc<dyn Serializer>,
    pub clock: Arc<dyn Clock>,
    pub transport_version: String,
    pub http_client_id: String,
    pub on_request_data_created: Option<RequestDataCallback>,
    pub on_request_completed: Option<RequestCompletedCallback>,
}

/// The final, successful shape a pipeline run produces.
pub struct PipelineResponse {
    pub status_code: http::StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub node_uri: String,
    pub audit_trail: Vec<AuditEntry>,
}

struct CallOutcome {
    response: InvokerResponse,
    success: bool,
}

/// Orchestrates one call end-to-end against a shared [`PipelineContext`].
pub struct RequestPipeline {
    context: Arc<PipelineContext>,
    bound: BoundConfiguration,
    auditor: Auditor,
    cancel: CancellationToken,
    /// The most recently observed `ApiCallDetails`, updated on every attempt
    /// (success or failure) and read back at finalization (§4.4.7) to attach
    /// to the terminal exception and to pass to `onRequestCompleted`.
    last_call: Mutex<Option<ApiCallDetails>>,
}

impl RequestPipeline {
    pub fn new(context: Arc<PipelineContext>, bound: BoundConfiguration, cancel: CancellationToken) -> Self {
        Self {
            context,
            bound,
            auditor: Auditor::new(),
            cancel,
            last_call: Mutex::new(None),
        }
    }

    fn record_call_details(&self, details: ApiCallDetails) {
        *self.last_call.lock() = Some(details);
    }

    /// Fires `onRequestCompleted` (if configured) with the final
    /// `ApiCallDetails`, regardless of whether the call succeeded or
    /// failed (§4.4.7, §6.6). Called exactly once per `run`.
    fn invoke_on_request_completed(&self) {
        if let Some(callback) = &self.context.on_request_completed {
            let details = self.last_call.lock().clone().unwrap_or_default();
            callback.0(&details);
        }
    }

    fn clock(&self) -> &dyn Clock {
        self.context.clock.as_ref()
    }

    /// Runs the full pipeline for one logical request, guaranteeing
    /// `onRequestCompleted` fires exactly once at finalization regardless of
    /// which branch below resolved (§4.4.7).
    pub async fn run(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
    ) -> Result<PipelineResponse, UnexpectedTransportException> {
        let result = self.run_inner(method, path, body).await;
        self.invoke_on_request_completed();
        result
    }

    async fn run_inner(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
    ) -> Result<PipelineResponse, UnexpectedTransportException> {
        if self.cancel.is_cancelled() {
            self.auditor.emit(AuditEvent::CancellationRequested, None);
            return Err(self.finalize_error(PipelineError::CancellationRequested, &method, path));
        }

        if let Err(err) = self.first_use_bootstrap().await {
            return Err(self.finalize_error(err, &method, path));
        }

        let body_bytes = match self.encode_body(&body) {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.finalize_error(err, &method, path)),
        };

        if self.context.pool.is_single_node() {
            return self.run_single_node(method, path, body_bytes).await;
        }

        self.run_with_failover(method, path, body_bytes).await
    }

    async fn run_single_node(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<PipelineResponse, UnexpectedTransportException> {
        let mut view = self.context.pool.view(self.clock(), Some(&self.auditor));
        let Some(selection) = view.next() else {
            self.auditor.emit(AuditEvent::NoNodesAttempted, None);
            return Err(self.finalize_error(PipelineError::NoNodesAttempted, &method, path));
        };
        let node = selection.node;

        match self.attempt(node.clone(), method.clone(), path, body).await {
            Ok(outcome) if outcome.success => {
                // `attempt`'s `AuditScope` already recorded the terminal
                // `HealthyResponse` entry on drop; do not emit it again here.
                node.mark_alive();
                Ok(self.build_response(outcome.response, node.redacted_uri()))
            }
            Ok(outcome) => {
                node.mark_dead(self.clock(), Some(self.bound.dead_timeout), Some(self.bound.max_dead_timeout));
                let status_code = outcome.response.status_code.as_u16();
                Err(self.finalize_error(
                    PipelineError::BadResponse {
                        node_uri: node.redacted_uri(),
                        status_code: Some(status_code),
                    },
                    &method,
                    path,
                ))
            }
            Err(err) => {
                node.mark_dead(self.clock(), Some(self.bound.dead_timeout), Some(self.bound.max_dead_timeout));
                Err(self.finalize_error(err, &method, path))
            }
        }
    }

    async fn run_with_failover(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<PipelineResponse, UnexpectedTransportException> {
        let started = self.clock().now();
        let mut attempts: u32 = 0;
        let mut attempted_any = false;
        let mut last_error: Option<PipelineError> = None;
        let mut terminal_error: Option<PipelineError> = None;

        for selection in self.context.pool.view(self.clock(), Some(&self.auditor)) {
            if self.cancel.is_cancelled() {
                self.auditor.emit(AuditEvent::CancellationRequested, None);
                terminal_error = Some(PipelineError::CancellationRequested);
                break;
            }

            if self.should_sniff_stale_cluster() {
                if let Err(err) = self.sniff(AuditEvent::SniffOnStaleCluster, true).await {
                    terminal_error = Some(err);
                    break;
                }
            }

            attempted_any = true;
            let node = selection.node;

            if let Err(ping_err) = self.ping(node.clone()).await {
                node.mark_dead(self.clock(), Some(self.bound.dead_timeout), Some(self.bound.max_dead_timeout));
                last_error = Some(ping_err);
                self.sniff_on_connection_fault_if_configured().await;
                attempts += 1;
                if let Some(budget_error) = self.check_retry_budget(attempts, started) {
                    terminal_error = Some(budget_error);
                    break;
                }
                continue;
            }

            let outcome = match self.attempt(node.clone(), method.clone(), path, body.clone()).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    node.mark_dead(self.clock(), Some(self.bound.dead_timeout), Some(self.bound.max_dead_timeout));
                    last_error = Some(err);
                    self.sniff_on_connection_fault_if_configured().await;
                    attempts += 1;
                    if let Some(budget_error) = self.check_retry_budget(attempts, started) {
                        terminal_error = Some(budget_error);
                        break;
                    }
                    continue;
                }
            };

            if outcome.success {
                // `attempt`'s `AuditScope` already recorded the terminal
                // `HealthyResponse` entry on drop; do not emit it again here.
                node.mark_alive();
                return Ok(self.build_response(outcome.response, node.redacted_uri()));
            }

            node.mark_dead(self.clock(), Some(self.bound.dead_timeout), Some(self.bound.max_dead_timeout));
            last_error = Some(PipelineError::BadResponse {
                node_uri: node.redacted_uri(),
                status_code: Some(outcome.response.status_code.as_u16()),
            });
            self.sniff_on_connection_fault_if_configured().await;
            attempts += 1;
            if let Some(budget_error) = self.check_retry_budget(attempts, started) {
                terminal_error = Some(budget_error);
                break;
            }
        }

        if !attempted_any {
            self.auditor.emit(AuditEvent::NoNodesAttempted, None);
            return Err(self.finalize_error(PipelineError::NoNodesAttempted, &method, path));
        }

        let error = terminal_error.unwrap_or_else(|| {
            self.auditor.emit(AuditEvent::FailedOverAllNodes, None);
            last_error.unwrap_or(PipelineError::FailedOverAllNodes { attempts })
        });
        Err(self.finalize_error(error, &method, path))
    }

    /// `Some(error)` iff the retry budget (wall-clock or attempt count) is
    /// exhausted and the loop must stop, also emitting the matching audit
    /// event. `None` means keep iterating.
    fn check_retry_budget(&self, attempts: u32, started: Instant) -> Option<PipelineError> {
        if self.clock().now().duration_since(started) > self.bound.max_retry_timeout {
            self.auditor.emit(AuditEvent::MaxTimeoutReached, None);
            return Some(PipelineError::MaxTimeoutReached { attempts });
        }
        // `attempts` counts attempts already made; `effective_max_retries` is
        // a *retry* budget (attempts beyond the first), so the pool's N
        // nodes are all tried before giving up: break once attempts exceeds
        // the retry budget, not once it reaches it.
        let effective_max_retries = self.bound.effective_max_retries(self.context.pool.max_retries() as u32);
        if attempts > effective_max_retries {
            self.auditor.emit(AuditEvent::MaxRetriesReached, None);
            return Some(PipelineError::MaxRetriesReached { attempts });
        }
        None
    }

    async fn sniff_on_connection_fault_if_configured(&self) {
        if self.bound.sniff_on_connection_fault
            && self.context.pool.supports_reseeding()
            && self.context.product.supports_sniff()
        {
            let _ = self.sniff(AuditEvent::SniffOnFail, false).await;
        }
    }

    fn should_sniff_stale_cluster(&self) -> bool {
        let Some(lifespan) = self.bound.sniff_lifespan else {
            return false;
        };
        self.context.pool.supports_reseeding()
            && self.context.product.supports_sniff()
            && self.clock().now().duration_since(self.context.pool.last_update()) > lifespan
    }

    /// Runs the first-use bootstrap sniff (§4.4.1): a single process-wide
    /// semaphore, held across the whole attempt, released unconditionally.
    async fn first_use_bootstrap(&self) -> Result<(), PipelineError> {
        if !self.context.pool.supports_reseeding()
            || !self.context.product.supports_sniff()
            || !self.bound.sniff_on_startup
        {
            return Ok(());
        }
        let mut guard = self.context.pool.lock_startup_sniff().await;
        if *guard {
            return Ok(());
        }
        let result = self.sniff(AuditEvent::SniffOnStartup, false).await;
        *guard = true;
        result
    }

    /// Runs a sniff round against successive nodes of the current view
    /// until one succeeds or all fail (§4.4.3 / §4.4.4). `recheck_staleness`
    /// is set only for the stale-cluster trigger: callers that arrive while
    /// the sniff lock is held by another in-flight sniff wait on it, then
    /// re-check whether the pool is still stale before dispatching a
    /// redundant network round, reusing the winning caller's reseed instead.
    async fn sniff(&self, trigger: AuditEvent, recheck_staleness: bool) -> Result<(), PipelineError> {
        self.auditor.emit(trigger, None);
        let _coalesce = self.context.pool.sniff_lock().lock().await;

        if recheck_staleness && !self.should_sniff_stale_cluster() {
            return Ok(());
        }

        let view = self.context.pool.view(self.clock(), None);
        let mut last_error: Option<anyhow::Error> = None;

        for selection in view {
            let node = selection.node;
            let endpoint = Endpoint::new(Method::GET, self.context.product.sniff_path(), node.clone());
            let headers = self.build_headers(None);
            match self
                .context
                .invoker
                .call(&endpoint, Method::GET, headers, Bytes::new(), self.bound.request_timeout)
                .await
            {
                Ok(response) if response.status_code.is_success() => {
                    match self.context.product.parse_sniff_response(&response.body) {
                        Ok(nodes) => match self.context.pool.reseed(nodes) {
                            Ok(()) => {
                                self.auditor.emit(AuditEvent::SniffSuccess, Some(node.redacted_uri()));
                                tracing::debug!(node = %node.redacted_uri(), "sniff reseeded the node pool");
                                return Ok(());
                            }
                            Err(err) => last_error = Some(anyhow::anyhow!(err)),
                        },
                        Err(err) => last_error = Some(err),
                    }
                }
                Ok(response) => {
                    last_error = Some(anyhow::anyhow!("sniff returned status {}", response.status_code));
                }
                Err(err) => {
                    last_error = Some(anyhow::anyhow!("{err}"));
                }
            }
        }

        self.auditor.emit(AuditEvent::SniffFailure, None);
        tracing::warn!("sniff failed against every node in the current view");
        Err(PipelineError::SniffFailed { source: last_error })
    }

    /// Issues a liveness ping against `node`, when the product supports it
    /// and pings are not disabled (§4.4.5).
    async fn ping(&self, node: Arc<Node>) -> Result<(), PipelineError> {
        if !self.context.product.supports_ping() || self.bound.disable_pings {
            return Ok(());
        }
        let endpoint = Endpoint::new(self.context.product.ping_method(), self.context.product.ping_path(), node.clone());
        let mut scope = self.auditor.scope(AuditEvent::PingSuccess, Some(node.redacted_uri()));
        let headers = self.build_headers(None);
        match self
            .context
            .invoker
            .call(&endpoint, self.context.product.ping_method(), headers, Bytes::new(), self.bound.ping_timeout)
            .await
        {
            Ok(response) if response.status_code.is_success() => Ok(()),
            Ok(response) => {
                scope.set_event(AuditEvent::PingFailure);
                scope.fail(format!("status {}", response.status_code));
                tracing::warn!(node = %node.redacted_uri(), status = %response.status_code, "ping failed");
                Err(PipelineError::PingFailed {
                    node_uri: node.redacted_uri(),
                    source: anyhow::anyhow!("ping returned status {}", response.status_code),
                })
            }
            Err(err) => {
                scope.set_event(AuditEvent::PingFailure);
                scope.fail(format!("{err}"));
                tracing::warn!(node = %node.redacted_uri(), error = %err, "ping failed");
                Err(PipelineError::PingFailed {
                    node_uri: node.redacted_uri(),
                    source: anyhow::anyhow!("{err}"),
                })
            }
        }
    }

    /// Issues the product call against `node` and classifies the result via
    /// `successOrKnownError` (§4.4.2, §4.4.6). Returns `Err` only when the
    /// invoker never reached the server; a reached-but-unhealthy response is
    /// `Ok(CallOutcome { success: false, .. })`.
    async fn attempt(&self, node: Arc<Node>, method: Method, path: &str, body: Bytes) -> Result<CallOutcome, PipelineError> {
        let endpoint = Endpoint::new(method.clone(), path, node.clone());
        let mut scope = self.auditor.scope(AuditEvent::HealthyResponse, Some(node.redacted_uri()));
        let headers = self.build_headers(Some(&method));
        let request_body = if body.is_empty() { None } else { Some(body.clone()) };

        if let Some(callback) = &self.context.on_request_data_created {
            callback.0(&RequestData {
                method: method.clone(),
                path_and_query: path.to_string(),
                node_uri: node.redacted_uri(),
                body: request_body.clone(),
            });
        }

        let response = match self
            .context
            .invoker
            .call(&endpoint, method.clone(), headers, body, self.bound.request_timeout)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                scope.set_event(AuditEvent::BadRequest);
                scope.fail(format!("{err}"));
                self.record_call_details(ApiCallDetails {
                    success: false,
                    http_status_code: None,
                    node_uri: Some(node.redacted_uri()),
                    request_body_in_bytes: request_body,
                    response_body_in_bytes: None,
                    tcp_states: None,
                    thread_pool_stats: None,
                });
                return Err(PipelineError::BadRequest { message: format!("{err}") });
            }
        };

        let success = self.success_or_known_error(&method, &response);
        if !success {
            scope.set_event(AuditEvent::BadResponse);
            scope.fail(format!("status {}", response.status_code));
        }
        self.record_call_details(ApiCallDetails {
            success,
            http_status_code: Some(response.status_code.as_u16()),
            node_uri: Some(node.redacted_uri()),
            request_body_in_bytes: request_body,
            response_body_in_bytes: Some(response.body.clone()),
            tcp_states: None,
            thread_pool_stats: None,
        });
        Ok(CallOutcome { response, success })
    }

    /// `successOrKnownError` (§4.4.2): 2xx with expected content type, or a
    /// 4xx/5xx the product registration accepts as a known error and that
    /// is not 502/503/504 — those, and any content-type mismatch, always
    /// retry. HEAD responses are exempt from the content-type check since a
    /// HEAD response carries no body.
    fn success_or_known_error(&self, method: &Method, response: &InvokerResponse) -> bool {
        match self.context.product.http_status_code_classifier(method, response.status_code) {
            StatusClass::UnknownError => false,
            _ if *method == Method::HEAD => true,
            _ => response
                .content_type
                .as_deref()
                .is_some_and(|ct| ct.starts_with(self.context.product.mime_type())),
        }
    }

    fn build_headers(&self, method: Option<&Method>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in self.context.product.default_headers() {
            if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
                headers.insert(name, value);
            }
        }
        let user_agent = meta::user_agent(
            self.context.product.name(),
            self.context.product.product_version(),
            &self.context.transport_version,
        );
        if let Ok(value) = HeaderValue::try_from(user_agent) {
            headers.insert(http::header::USER_AGENT, value);
        }
        if let Some(method) = method {
            if *method != Method::HEAD {
                if let Some(accept) = &self.bound.accept {
                    if let Ok(value) = HeaderValue::try_from(accept.as_str()) {
                        headers.insert(http::header::ACCEPT, value);
                    }
                }
                if let Some(content_type) = &self.bound.content_type {
                    if let Ok(value) = HeaderValue::try_from(content_type.as_str()) {
                        headers.insert(http::header::CONTENT_TYPE, value);
                    }
                }
            }
        }
        for (key, value) in &self.bound.extra_headers {
            if let (Ok(name), Ok(value)) = (HeaderName::try_from(key.as_str()), HeaderValue::try_from(value.as_str())) {
                headers.insert(name, value);
            }
        }
        if self.bound.http_compression {
            headers.insert(http::header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }
        if !self.bound.disable_meta_header {
            let header_value = meta::client_meta_header(
                &self.context.transport_version,
                env!("CARGO_PKG_VERSION"),
                &self.context.http_client_id,
                None,
            );
            if let Ok(value) = HeaderValue::try_from(header_value) {
                headers.insert(HeaderName::from_static("x-elastic-client-meta"), value);
            }
        }
        headers
    }

    fn encode_body(&self, body: &RequestBody) -> Result<Bytes, PipelineError> {
        match body {
            RequestBody::None => Ok(Bytes::new()),
            RequestBody::Bytes(bytes) => Ok(bytes.clone()),
            RequestBody::Json(value) => self
                .context
                .serializer
                .serialize(value)
                .map_err(|err| PipelineError::BadRequest { message: format!("failed to serialize request body: {err}") }),
        }
    }

    fn build_response(&self, response: InvokerResponse, node_uri: String) -> PipelineResponse {
        PipelineResponse {
            status_code: response.status_code,
            headers: response.headers,
            body: response.body,
            node_uri,
            audit_trail: self.auditor.entries(),
        }
    }

    fn finalize_error(&self, error: PipelineError, method: &Method, path: &str) -> UnexpectedTransportException {
        tracing::warn!(%method, path, error = %error, "request failed");
        UnexpectedTransportException::new(
            error,
            method.clone(),
            path.to_string(),
            self.auditor.entries(),
            self.last_call.lock().clone(),
        )
    }
}
