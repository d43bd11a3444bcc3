//! Product-specific knowledge the pipeline consumes but never hard-codes:
//! where to sniff, where to ping, and how to read a status code (§6.3).

use http::{Method, StatusCode};

use crate::node::Node;

/// The three-way classification `successOrKnownError` (§4.4.2) is built on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    KnownError,
    UnknownError,
}

/// Product-specific sniff/ping/status-code interpretation. One instance is
/// shared by every pipeline running against a given transport.
pub trait ProductRegistration: Send + Sync {
    fn name(&self) -> &str;
    fn product_version(&self) -> &str;
    fn supports_sniff(&self) -> bool;
    fn supports_ping(&self) -> bool;

    /// Path to request when sniffing for topology. Only called when
    /// `supports_sniff()` is true.
    fn sniff_path(&self) -> &str {
        "/"
    }

    /// Parses a sniff response body into the new node list. Only called
    /// when `supports_sniff()` is true.
    fn parse_sniff_response(&self, body: &[u8]) -> Result<Vec<Node>, anyhow::Error>;

    /// Path and method to use for a liveness ping. Only called when
    /// `supports_ping()` is true.
    fn ping_path(&self) -> &str {
        "/"
    }

    fn ping_method(&self) -> Method {
        Method::HEAD
    }

    /// Classifies a `(method, statusCode)` pair so product-specific
    /// semantics (e.g. HEAD-404 treated as success) are honored.
    fn http_status_code_classifier(&self, method: &Method, status: StatusCode) -> StatusClass;

    fn default_headers(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn mime_type(&self) -> &str {
        "application/json"
    }
}

/// Opts out of both sniffing and pinging; the right default for a product
/// with no topology-discovery or health-check endpoint.
pub struct DefaultProductRegistration {
    name: String,
    version: String,
}

impl DefaultProductRegistration {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl ProductRegistration for DefaultProductRegistration {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_version(&self) -> &str {
        &self.version
    }

    fn supports_sniff(&self) -> bool {
        false
    }

    fn supports_ping(&self) -> bool {
        false
    }

    fn parse_sniff_response(&self, _body: &[u8]) -> Result<Vec<Node>, anyhow::Error> {
        anyhow::bail!("{} does not support sniffing", self.name)
    }

    fn http_status_code_classifier(&self, _method: &Method, status: StatusCode) -> StatusClass {
        default_status_classifier(status)
    }
}

/// `Elasticsearch` sniffs via `/_nodes/http?flat_settings`, pings via
/// `HEAD /`, and treats a HEAD-404 as a logical absence — still a success,
/// not a retry trigger (§6.3).
pub struct ElasticsearchProductRegistration {
    version: String,
}

impl ElasticsearchProductRegistration {
    pub fn new(version: impl Into<String>) -> Self {
        Self { version: version.into() }
    }
}

impl ProductRegistration for ElasticsearchProductRegistration {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    fn product_version(&self) -> &str {
        &self.version
    }

    fn supports_sniff(&self) -> bool {
        true
    }

    fn supports_ping(&self) -> bool {
        true
    }

    fn sniff_path(&self) -> &str {
        "/_nodes/http?flat_settings"
    }

    fn parse_sniff_response(&self, body: &[u8]) -> Result<Vec<Node>, anyhow::Error> {
        parse_nodes_http_response(body)
    }

    fn ping_path(&self) -> &str {
        "/"
    }

    fn http_status_code_classifier(&self, method: &Method, status: StatusCode) -> StatusClass {
        if *method == Method::HEAD && status == StatusCode::NOT_FOUND {
            return StatusClass::Success;
        }
        default_status_classifier(status)
    }

    fn default_headers(&self) -> Vec<(&'static str, String)> {
        vec![("accept", "application/json".to_string())]
    }
}

fn default_status_classifier(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if matches!(status.as_u16(), 502 | 503 | 504) {
        StatusClass::UnknownError
    } else if status.is_client_error() || status.is_server_error() {
        StatusClass::KnownError
    } else {
        StatusClass::UnknownError
    }
}

/// Parses the subset of a `GET /_nodes/http?flat_settings` response body
/// this transport cares about: `nodes.<id>.{name,http.publish_address,
/// roles,settings}`. Deliberately minimal — the full response carries far
/// more than node identity, none of which the pool needs.
fn parse_nodes_http_response(body: &[u8]) -> Result<Vec<Node>, anyhow::Error> {
    use std::collections::{HashMap, HashSet};
    use url::Url;

    let value: serde_json::Value = serde_json::from_slice(body)?;
    let nodes_obj = value
        .get("nodes")
        .and_then(|v| v.as_object())
        .ok_or_else(|| anyhow::anyhow!("sniff response missing 'nodes' object"))?;

    let mut nodes = Vec::new();
    for (id, entry) in nodes_obj {
        let publish_address = entry
            .get("http")
            .and_then(|h| h.get("publish_address"))
            .and_then(|v| v.as_str());
        let Some(publish_address) = publish_address else {
            continue;
        };
        let host_port = publish_address.rsplit_once('/').map_or(publish_address, |(_, hp)| hp);
        let uri = Url::parse(&format!("http://{host_port}"))?;

        let name = entry.get("name").and_then(|v| v.as_str()).map(|s| s.to_string());
        let roles: HashSet<String> = entry
            .get("roles")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|r| r.as_str()).map(|s| s.to_string()).collect())
            .unwrap_or_default();
        let settings: HashMap<String, String> = entry
            .get("settings")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        nodes.push(Node::with_metadata(uri, Some(id.clone()), name, roles, settings));
    }

    Ok(nodes)
}
