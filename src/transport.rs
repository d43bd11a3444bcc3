//! `Transport`: the thin facade a caller actually holds — `(method, path,
//! body) -> response<T>`, with the pool/product/invoker/serializer wiring
//! and per-call pipeline construction hidden behind it (§6.1, C8).

use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::{RequestConfiguration, TransportConfiguration};
use crate::error::{PipelineError, UnexpectedTransportException};
use crate::invoker::{HyperRequestInvoker, RequestInvoker};
use crate::pipeline::{PipelineContext, RequestBody, RequestPipeline};
use crate::pool::NodePool;
use crate::product::ProductRegistration;
use crate::serializer::{JsonSerializer, ResponseBuilder, Serializer};

/// A response returned to the caller. When `config.throw_exceptions` is
/// false and the call ultimately failed, `original_exception` carries the
/// failure instead of `Transport::request` returning `Err` (§4.4.7).
pub struct TransportResponse {
    pub status_code: StatusCode,
    pub body: Bytes,
    pub node_uri: String,
    pub audit_trail: Vec<crate::audit::AuditEntry>,
    pub original_exception: Option<UnexpectedTransportException>,
}

impl TransportResponse {
    pub fn has_successful_status_code(&self) -> bool {
        self.status_code.is_success() && self.original_exception.is_none()
    }

    /// Parses the body via `builder` as `T`, or returns `None` if the call
    /// itself failed before a body was available.
    pub fn parse<T: Send + 'static>(&self, builder: &ResponseBuilder) -> Option<Result<T, crate::serializer::ResponseBuildError>> {
        if self.original_exception.is_some() {
            return None;
        }
        Some(builder.build(&self.body, self.status_code))
    }
}

/// Builds a [`Transport`]. Every field but the pool and product registration
/// has a sensible default.
pub struct TransportBuilder {
    pool: Arc<NodePool>,
    product: Arc<dyn ProductRegistration>,
    invoker: Arc<dyn RequestInvoker>,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    config: TransportConfiguration,
    transport_version: String,
    http_client_id: String,
}

impl TransportBuilder {
    pub fn new(pool: NodePool, product: Arc<dyn ProductRegistration>) -> Self {
        Self {
            pool: Arc::new(pool),
            product,
            invoker: Arc::new(HyperRequestInvoker::new()),
            serializer: Arc::new(JsonSerializer),
            clock: Arc::new(SystemClock),
            config: TransportConfiguration::default(),
            transport_version: env!("CARGO_PKG_VERSION").to_string(),
            http_client_id: "hy".to_string(),
        }
    }

    pub fn invoker(mut self, invoker: Arc<dyn RequestInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: TransportConfiguration) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Transport {
        let on_request_data_created = self.config.on_request_data_created.clone();
        let on_request_completed = self.config.on_request_completed.clone();
        Transport {
            context: Arc::new(PipelineContext {
                pool: self.pool,
                product: self.product,
                invoker: self.invoker,
                serializer: self.serializer,
                clock: self.clock,
                transport_version: self.transport_version,
                http_client_id: self.http_client_id,
                on_request_data_created,
                on_request_completed,
            }),
            config: self.config,
        }
    }
}

/// Reentrant, thread-safe facade shared by every concurrent caller. One
/// `Transport` owns one pool and one product registration; each call gets
/// its own [`RequestPipeline`] and [`crate::audit::Auditor`] (§5).
pub struct Transport {
    context: Arc<PipelineContext>,
    config: TransportConfiguration,
}

impl Transport {
    pub fn builder(pool: NodePool, product: Arc<dyn ProductRegistration>) -> TransportBuilder {
        TransportBuilder::new(pool, product)
    }

    /// `request(method, path, body?, requestConfig?, cancel?) -> response<T>` (§6.1).
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        request_config: Option<RequestConfiguration>,
        cancel: Option<CancellationToken>,
    ) -> TransportResponse {
        let request_config = request_config.unwrap_or_default();
        let bound = crate::config::BoundConfiguration::new(&self.config, &request_config);
        let cancel = cancel.unwrap_or_default();
        let pipeline = RequestPipeline::new(self.context.clone(), bound, cancel);

        match pipeline.run(method, path, body).await {
            Ok(response) => TransportResponse {
                status_code: response.status_code,
                body: response.body,
                node_uri: response.node_uri,
                audit_trail: response.audit_trail,
                original_exception: None,
            },
            Err(exception) => {
                // §4.4.7: when the failure reached a node, attach the most
                // recent `ApiCallDetails` (status/node) instead of a
                // fabricated 500. Errors that never reached a server
                // (`NoNodesAttempted`, `CancellationRequested`, ...) fall
                // back to the placeholders.
                let status_code = exception
                    .source
                    .status_code()
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let node_uri = exception.source.node_uri().map(str::to_string).unwrap_or_default();
                TransportResponse {
                    status_code,
                    body: Bytes::new(),
                    node_uri,
                    audit_trail: exception.audit_trail.clone(),
                    original_exception: Some(exception),
                }
            }
        }
    }

    /// Like [`Self::request`], but honors `throw_exceptions` (§4.4.7,
    /// §6.6): when the effective bound configuration for this call has
    /// `throw_exceptions` set, a failed call surfaces as `Err` instead of a
    /// `TransportResponse` carrying `original_exception`. Otherwise this is
    /// equivalent to [`Self::request`] wrapped in `Ok`.
    pub async fn request_result(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        request_config: Option<RequestConfiguration>,
        cancel: Option<CancellationToken>,
    ) -> Result<TransportResponse, UnexpectedTransportException> {
        let throw_exceptions = request_config
            .as_ref()
            .and_then(|r| r.throw_exceptions)
            .unwrap_or(self.config.throw_exceptions);
        let response = self.request(method, path, body, request_config, cancel).await;
        match response.original_exception {
            Some(exception) if throw_exceptions => Err(exception),
            _ => Ok(response),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }
}

impl From<PipelineError> for UnexpectedTransportException {
    fn from(error: PipelineError) -> Self {
        UnexpectedTransportException::new(error, Method::GET, String::new(), Vec::new(), None)
    }
}
