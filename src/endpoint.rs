//! The unit of work the pipeline hands to a [`crate::invoker::RequestInvoker`]:
//! a method and path bound to one concrete node.

use std::sync::Arc;

use http::Method;
use url::Url;

use crate::invoker::BoxError;
use crate::node::Node;

/// A fully-resolved request target: an HTTP method and path-and-query,
/// bound to the specific node it will be sent to. Built fresh for each
/// attempt, since failover rebinds the same logical request to a new node.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub method: Method,
    pub path_and_query: String,
    pub node: Arc<Node>,
}

impl Endpoint {
    pub fn new(method: Method, path_and_query: impl Into<String>, node: Arc<Node>) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            node,
        }
    }

    /// The absolute URL this endpoint resolves to: the node's base URI with
    /// `path_and_query` appended.
    pub fn url(&self) -> Result<Url, BoxError> {
        let base = self.node.uri().as_str().trim_end_matches('/');
        let path = self.path_and_query.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}")).map_err(|e| -> BoxError { Box::new(e) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node as NodeType;

    fn node(uri: &str) -> Arc<NodeType> {
        Arc::new(NodeType::new(Url::parse(uri).unwrap()))
    }

    #[test]
    fn url_joins_base_and_path() {
        let endpoint = Endpoint::new(Method::GET, "/_cluster/health", node("http://a:9200"));
        assert_eq!(endpoint.url().unwrap().as_str(), "http://a:9200/_cluster/health");
    }

    #[test]
    fn url_handles_query_string() {
        let endpoint = Endpoint::new(Method::GET, "_nodes/http?flat_settings", node("http://a:9200"));
        assert_eq!(
            endpoint.url().unwrap().as_str(),
            "http://a:9200/_nodes/http?flat_settings"
        );
    }
}
