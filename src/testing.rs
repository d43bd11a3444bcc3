//! Test doubles shared between unit tests and the `tests/pipeline.rs`
//! integration suite. Kept as an ordinary public module (not `#[cfg(test)]`)
//! since integration tests live in a separate crate and need to reach it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::endpoint::Endpoint;
use crate::invoker::{BoxError, InvokerResponse, RequestInvoker};

/// One queued response (or failure) for a node, keyed by its base URI.
pub enum ScriptedResponse {
    Ok {
        status_code: StatusCode,
        content_type: Option<&'static str>,
        body: &'static [u8],
    },
    Err(&'static str),
}

impl ScriptedResponse {
    pub fn json(status_code: u16, body: &'static [u8]) -> Self {
        ScriptedResponse::Ok {
            status_code: StatusCode::from_u16(status_code).unwrap(),
            content_type: Some("application/json"),
            body,
        }
    }

    pub fn status(status_code: u16) -> Self {
        ScriptedResponse::Ok {
            status_code: StatusCode::from_u16(status_code).unwrap(),
            content_type: Some("application/json"),
            body: b"{}",
        }
    }

    pub fn failure(message: &'static str) -> Self {
        ScriptedResponse::Err(message)
    }
}

/// A [`RequestInvoker`] that drains a per-node queue of scripted responses
/// instead of doing real I/O. Panics with a descriptive message if a test
/// under-provisions responses for a node it actually attempts, so a test's
/// node-attempt count is self-documenting.
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `response` to be returned the next time this node's base URI
    /// is called.
    pub fn queue(&self, node_uri: &str, response: ScriptedResponse) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(node_uri.to_string())
            .or_default()
            .push_back(response);
        self
    }
}

#[async_trait]
impl RequestInvoker for ScriptedInvoker {
    async fn call(
        &self,
        endpoint: &Endpoint,
        _method: Method,
        _headers: HeaderMap,
        _body: Bytes,
        _timeout: Duration,
    ) -> Result<InvokerResponse, BoxError> {
        let key = endpoint.node.uri().to_string();
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.get_mut(&key).unwrap_or_else(|| {
            panic!("ScriptedInvoker: node {key} was attempted but has no queued responses")
        });
        let scripted = queue.pop_front().unwrap_or_else(|| {
            panic!("ScriptedInvoker: node {key} was attempted more times than it was scripted for")
        });

        match scripted {
            ScriptedResponse::Ok { status_code, content_type, body } => Ok(InvokerResponse {
                status_code,
                headers: HeaderMap::new(),
                body: Bytes::from_static(body),
                content_type: content_type.map(|s| s.to_string()),
            }),
            ScriptedResponse::Err(message) => Err(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn endpoint(uri: &str) -> Endpoint {
        let node = std::sync::Arc::new(crate::node::Node::new(Url::parse(uri).unwrap()));
        Endpoint::new(Method::GET, "/", node)
    }

    #[tokio::test]
    async fn drains_queued_responses_in_order() {
        let invoker = ScriptedInvoker::new();
        invoker.queue("http://a:9200/", ScriptedResponse::json(200, b"{\"ok\":true}"));
        invoker.queue("http://a:9200/", ScriptedResponse::status(502));

        let first = invoker
            .call(&endpoint("http://a:9200"), Method::GET, HeaderMap::new(), Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first.status_code, StatusCode::OK);

        let second = invoker
            .call(&endpoint("http://a:9200"), Method::GET, HeaderMap::new(), Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second.status_code, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    #[should_panic(expected = "no queued responses")]
    async fn panics_on_unscripted_node() {
        let invoker = ScriptedInvoker::new();
        let _ = invoker
            .call(&endpoint("http://unscripted:9200"), Method::GET, HeaderMap::new(), Bytes::new(), Duration::from_secs(1))
            .await;
    }
}
