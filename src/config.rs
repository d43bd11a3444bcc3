//! Transport-wide and per-request configuration, and the merge of the two
//! ("bound configuration") that the pipeline actually consumes for one call.
//!
//! `TransportConfiguration` and `RequestConfiguration` derive `serde` so
//! either can plausibly be loaded from a config file, matching the
//! teacher's configuration-shaped structs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use serde::{Deserialize, Serialize};

use crate::error::ApiCallDetails;

const fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_ping_timeout() -> Duration {
    Duration::from_secs(2)
}

const fn default_dead_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_max_dead_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Authentication material passed through to the invoker untouched; the
/// pipeline never inspects these values.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Authentication {
    Basic { username: String, password: String },
    ApiKey { encoded: String },
    Bearer { token: String },
}

/// Proxy configuration passed through to the invoker untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfiguration {
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Request-dispatch metadata passed to `onRequestDataCreated` right before
/// one HTTP attempt is sent (§6.6).
#[derive(Clone, Debug)]
pub struct RequestData {
    pub method: Method,
    pub path_and_query: String,
    pub node_uri: String,
    pub body: Option<Bytes>,
}

/// Wraps a `dyn Fn` observability callback so the configuration structs that
/// hold one can still derive `Clone`/`Debug` (a bare `Arc<dyn Fn(..)>` field
/// would block `#[derive(Debug)]`).
#[derive(Clone)]
pub struct RequestDataCallback(pub Arc<dyn Fn(&RequestData) + Send + Sync>);

impl std::fmt::Debug for RequestDataCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RequestDataCallback(..)")
    }
}

/// Wraps the `onRequestCompleted` callback for the same reason as
/// [`RequestDataCallback`].
#[derive(Clone)]
pub struct RequestCompletedCallback(pub Arc<dyn Fn(&ApiCallDetails) + Send + Sync>);

impl std::fmt::Debug for RequestCompletedCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RequestCompletedCallback(..)")
    }
}

/// Transport-wide defaults shared by every call made through one
/// `Transport` instance (§6.6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfiguration {
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub ping_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub dead_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub max_dead_timeout: Duration,
    pub max_retries: Option<u32>,
    #[serde(with = "duration_millis_option")]
    pub max_retry_timeout: Option<Duration>,
    #[serde(with = "duration_millis_option")]
    pub sniff_lifespan: Option<Duration>,
    pub sniff_on_startup: bool,
    pub sniff_on_connection_fault: bool,
    pub disable_pings: bool,
    pub disable_direct_streaming: bool,
    pub disable_audit_trail: bool,
    pub disable_meta_header: bool,
    pub throw_exceptions: bool,
    pub http_compression: bool,
    pub proxy: Option<ProxyConfiguration>,
    pub authentication: Option<Authentication>,
    pub certificate_fingerprint: Option<String>,
    /// Fired right before each HTTP attempt is dispatched (§6.6). Not
    /// serializable; absent from any config file representation.
    #[serde(skip)]
    pub on_request_data_created: Option<RequestDataCallback>,
    /// Fired once per `Transport::request` call with the final
    /// `ApiCallDetails`, whether the call succeeded or failed (§6.6).
    #[serde(skip)]
    pub on_request_completed: Option<RequestCompletedCallback>,
}

impl Default for TransportConfiguration {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            ping_timeout: default_ping_timeout(),
            dead_timeout: default_dead_timeout(),
            max_dead_timeout: default_max_dead_timeout(),
            max_retries: None,
            max_retry_timeout: None,
            sniff_lifespan: None,
            sniff_on_startup: true,
            sniff_on_connection_fault: true,
            disable_pings: false,
            disable_direct_streaming: false,
            disable_audit_trail: false,
            disable_meta_header: false,
            throw_exceptions: false,
            http_compression: false,
            proxy: None,
            authentication: None,
            certificate_fingerprint: None,
            on_request_data_created: None,
            on_request_completed: None,
        }
    }
}

/// Per-request overrides, merged onto [`TransportConfiguration`] to produce
/// a [`BoundConfiguration`] for one call. `None` fields fall back to the
/// transport default.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestConfiguration {
    pub request_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub accept: Option<String>,
    pub content_type: Option<String>,
    pub extra_headers: HashMap<String, String>,
    pub disable_direct_streaming: Option<bool>,
    pub throw_exceptions: Option<bool>,
}

/// The effective, immutable configuration for one call — transport defaults
/// merged with this call's overrides. Built once per call and never
/// mutated afterwards.
#[derive(Clone, Debug)]
pub struct BoundConfiguration {
    pub request_timeout: Duration,
    pub ping_timeout: Duration,
    pub dead_timeout: Duration,
    pub max_dead_timeout: Duration,
    pub max_retries_override: Option<u32>,
    pub max_retry_timeout: Duration,
    pub sniff_lifespan: Option<Duration>,
    pub sniff_on_startup: bool,
    pub sniff_on_connection_fault: bool,
    pub disable_pings: bool,
    pub disable_direct_streaming: bool,
    pub disable_audit_trail: bool,
    pub disable_meta_header: bool,
    pub throw_exceptions: bool,
    pub http_compression: bool,
    pub accept: Option<String>,
    pub content_type: Option<String>,
    pub extra_headers: HashMap<String, String>,
}

impl BoundConfiguration {
    pub fn new(transport: &TransportConfiguration, request: &RequestConfiguration) -> Self {
        let request_timeout = request.request_timeout.unwrap_or(transport.request_timeout);
        Self {
            request_timeout,
            ping_timeout: transport.ping_timeout.min(request_timeout),
            dead_timeout: transport.dead_timeout,
            max_dead_timeout: transport.max_dead_timeout,
            max_retries_override: request.max_retries.or(transport.max_retries),
            max_retry_timeout: transport.max_retry_timeout.unwrap_or(request_timeout),
            sniff_lifespan: transport.sniff_lifespan,
            sniff_on_startup: transport.sniff_on_startup,
            sniff_on_connection_fault: transport.sniff_on_connection_fault,
            disable_pings: transport.disable_pings,
            disable_direct_streaming: request
                .disable_direct_streaming
                .unwrap_or(transport.disable_direct_streaming),
            disable_audit_trail: transport.disable_audit_trail,
            disable_meta_header: transport.disable_meta_header,
            throw_exceptions: request.throw_exceptions.unwrap_or(transport.throw_exceptions),
            http_compression: transport.http_compression,
            accept: request.accept.clone(),
            content_type: request.content_type.clone(),
            extra_headers: request.extra_headers.clone(),
        }
    }

    /// `min(requestConfig.maxRetries ?? pool.maxRetries, pool.maxRetries)` (§4.4.2).
    pub fn effective_max_retries(&self, pool_max_retries: u32) -> u32 {
        self.max_retries_override.unwrap_or(pool_max_retries).min(pool_max_retries)
    }
}

/// `serde_with`-free duration (de)serialization helpers, written by hand
/// rather than pulling in `humantime-serde` for two fields.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod duration_millis_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_override_wins_over_transport_default() {
        let transport = TransportConfiguration::default();
        let mut request = RequestConfiguration::default();
        request.request_timeout = Some(Duration::from_secs(5));
        let bound = BoundConfiguration::new(&transport, &request);
        assert_eq!(bound.request_timeout, Duration::from_secs(5));
        assert_eq!(bound.ping_timeout, Duration::from_secs(2));
    }

    #[test]
    fn ping_timeout_bounded_above_by_request_timeout() {
        let mut transport = TransportConfiguration::default();
        transport.ping_timeout = Duration::from_secs(10);
        let mut request = RequestConfiguration::default();
        request.request_timeout = Some(Duration::from_secs(3));
        let bound = BoundConfiguration::new(&transport, &request);
        assert_eq!(bound.ping_timeout, Duration::from_secs(3));
    }

    #[test]
    fn effective_max_retries_is_the_lesser_of_both() {
        let transport = TransportConfiguration::default();
        let mut request = RequestConfiguration::default();
        request.max_retries = Some(10);
        let bound = BoundConfiguration::new(&transport, &request);
        assert_eq!(bound.effective_max_retries(3), 3);

        request.max_retries = Some(1);
        let bound = BoundConfiguration::new(&transport, &request);
        assert_eq!(bound.effective_max_retries(3), 1);
    }

    #[test]
    fn max_retry_timeout_defaults_to_request_timeout() {
        let transport = TransportConfiguration::default();
        let request = RequestConfiguration::default();
        let bound = BoundConfiguration::new(&transport, &request);
        assert_eq!(bound.max_retry_timeout, bound.request_timeout);
    }
}
