//! Elastic Cloud ID decoding.
//!
//! Wire format: `name:base64(host$esUUID[:port][$kibanaUUID[:port]])`. This
//! is bit-exact with existing deployments — every known failure condition is
//! checked explicitly rather than falling through to a generic parse error,
//! since client libraries in the wild match on these messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use url::Url;

use super::PoolError;

const DEFAULT_HTTPS_PORT: u16 = 443;

/// Which service's URI to target when building a pool from a cloud ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudTarget {
    Elasticsearch,
    Kibana,
}

/// A decoded Elastic Cloud ID.
#[derive(Clone, Debug)]
pub struct CloudId {
    pub name: String,
    pub elasticsearch_uri: Url,
    pub kibana_uri: Option<Url>,
}

impl CloudId {
    /// Decodes a cloud ID string per the wire format above.
    pub fn decode(id: &str) -> Result<Self, PoolError> {
        if id.trim().is_empty() {
            return Err(PoolError::CloudId("cloud id is null or empty".into()));
        }

        let (name, b64) = id
            .split_once(':')
            .ok_or_else(|| PoolError::CloudId("cloud id is missing a ':' separator".into()))?;

        if b64.is_empty() {
            return Err(PoolError::CloudId("cloud id base64 payload is empty".into()));
        }

        let decoded = STANDARD
            .decode(b64)
            .map_err(|e| PoolError::CloudId(format!("cloud id base64 payload is invalid: {e}")))?;
        let decoded = String::from_utf8(decoded).map_err(|_| {
            PoolError::CloudId("cloud id base64 payload is not valid utf-8".into())
        })?;

        let tokens: Vec<&str> = decoded.split('$').collect();
        if tokens.len() < 2 {
            return Err(PoolError::CloudId(
                "cloud id payload must contain at least two '$'-separated tokens (host, elasticsearch uuid)"
                    .into(),
            ));
        }

        let (host, host_port) = split_host_port(tokens[0], DEFAULT_HTTPS_PORT)?;
        if host.is_empty() {
            return Err(PoolError::CloudId("cloud id host component is empty".into()));
        }

        let (es_uuid, es_port) = split_host_port(tokens[1], host_port)?;
        if es_uuid.is_empty() {
            return Err(PoolError::CloudId(
                "cloud id elasticsearch uuid component is empty".into(),
            ));
        }
        let elasticsearch_uri = build_service_uri(&es_uuid, &host, es_port)?;

        let kibana_uri = match tokens.get(2) {
            Some(token) if !token.is_empty() => {
                let (kibana_uuid, kibana_port) = split_host_port(token, host_port)?;
                if kibana_uuid.is_empty() {
                    None
                } else {
                    Some(build_service_uri(&kibana_uuid, &host, kibana_port)?)
                }
            }
            _ => None,
        };

        Ok(Self {
            name: name.to_string(),
            elasticsearch_uri,
            kibana_uri,
        })
    }

    /// The URI for the requested target, or an error if a Kibana URI was
    /// requested but the cloud ID did not encode one.
    pub fn uri_for(&self, target: CloudTarget) -> Result<Url, PoolError> {
        match target {
            CloudTarget::Elasticsearch => Ok(self.elasticsearch_uri.clone()),
            CloudTarget::Kibana => self.kibana_uri.clone().ok_or_else(|| {
                PoolError::CloudId(
                    "cloud id does not contain a kibana uuid component".into(),
                )
            }),
        }
    }
}

fn split_host_port(token: &str, default_port: u16) -> Result<(String, u16), PoolError> {
    match token.split_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| PoolError::CloudId(format!("invalid port in cloud id token '{token}'")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((token.to_string(), default_port)),
    }
}

fn build_service_uri(uuid: &str, host: &str, port: u16) -> Result<Url, PoolError> {
    let raw = if port == DEFAULT_HTTPS_PORT {
        format!("https://{uuid}.{host}")
    } else {
        format!("https://{uuid}.{host}:{port}")
    };
    Url::parse(&raw).map_err(|e| PoolError::CloudId(format!("built an invalid uri '{raw}': {e}")))
}
