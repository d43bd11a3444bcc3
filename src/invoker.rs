//! `RequestInvoker`: the pluggable HTTP I/O layer the pipeline consumes but
//! does not interpret (§6.2). The default implementation reuses the
//! teacher's connection-management approach — one persistent HTTP/1.1
//! connection per node, established over TCP or TLS (rustls), cached and
//! re-established lazily — generalized from "one fixed host" to "one
//! connection per node the pool hands us".

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use url::Url;

use crate::endpoint::Endpoint;

/// Boxed error type for invoker failures, thread-safe and dynamically
/// dispatched.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The raw result of one HTTP attempt against one node. The pipeline reads
/// `status_code` and `content_type` to decide `successOrKnownError` and
/// does not otherwise interpret the bytes.
pub struct InvokerResponse {
    pub status_code: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// Executes a single HTTP request against one node. Implementations own
/// connection pooling, TLS, proxying, auth header attachment, and (request-
/// level) compression — the pipeline does not interpret any of these
/// concerns (§6.2).
#[async_trait]
pub trait RequestInvoker: Send + Sync {
    async fn call(
        &self,
        endpoint: &Endpoint,
        method: Method,
        headers: HeaderMap,
        body: Bytes,
        timeout: Duration,
    ) -> Result<InvokerResponse, BoxError>;
}

/// One cached HTTP/1.1 sender per `(scheme, authority)` pair. Re-established
/// lazily the next time that authority is dialed after the cached
/// connection task has exited.
struct CachedConnection {
    sender: AsyncMutex<SendRequest<Full<Bytes>>>,
}

/// Default [`RequestInvoker`] backed by `hyper`'s HTTP/1.1 client connection
/// API, with TLS via `rustls` when the `tls` feature is enabled. Caches one
/// connection per node rather than opening one client per process.
pub struct HyperRequestInvoker {
    connections: SyncMutex<std::collections::HashMap<String, Arc<CachedConnection>>>,
}

impl HyperRequestInvoker {
    pub fn new() -> Self {
        Self {
            connections: SyncMutex::new(std::collections::HashMap::new()),
        }
    }

    async fn connection_for(&self, url: &Url) -> Result<Arc<CachedConnection>, BoxError> {
        let key = format!("{}://{}", url.scheme(), url.authority());

        if let Some(existing) = self.connections.lock().get(&key).cloned() {
            if !existing.sender.lock().await.is_closed() {
                return Ok(existing);
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| -> BoxError { "node uri has no host".into() })?;
        let scheme_default_port = if url.scheme() == "https" { 443 } else { 80 };
        let port = url.port().unwrap_or(scheme_default_port);

        let sender = if url.scheme() == "https" {
            self.connect_tls(host, port).await?
        } else {
            self.connect_plain(host, port).await?
        };

        let cached = Arc::new(CachedConnection {
            sender: AsyncMutex::new(sender),
        });
        self.connections.lock().insert(key, cached.clone());
        Ok(cached)
    }

    async fn connect_plain(&self, host: &str, port: u16) -> Result<SendRequest<Full<Bytes>>, BoxError> {
        let addr = format!("{host}:{port}");
        let tcp_stream = TcpStream::connect(addr).await?;
        let io = TokioIo::new(tcp_stream);
        let (sender, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(io).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::error!("connection error: {}", err);
            }
        });
        Ok(sender)
    }

    #[cfg(feature = "tls")]
    async fn connect_tls(&self, host: &str, port: u16) -> Result<SendRequest<Full<Bytes>>, BoxError> {
        use rustls::pki_types::ServerName;
        use rustls::{ClientConfig, RootCertStore};
        use tokio_rustls::TlsConnector;
        use webpki_roots::TLS_SERVER_ROOTS;

        let addr = format!("{host}:{port}");
        let tcp_stream = TcpStream::connect(addr).await?;

        let mut root_cert_store = RootCertStore::empty();
        root_cert_store.extend(TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| -> BoxError { Box::new(e) })?;
        let tls_stream = connector.connect(server_name, tcp_stream).await?;
        let io = TokioIo::new(tls_stream);

        let (sender, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(io).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::error!("connection error: {}", err);
            }
        });
        Ok(sender)
    }

    #[cfg(not(feature = "tls"))]
    async fn connect_tls(&self, _host: &str, _port: u16) -> Result<SendRequest<Full<Bytes>>, BoxError> {
        Err("TLS support requires the `tls` feature".into())
    }
}

impl Default for HyperRequestInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestInvoker for HyperRequestInvoker {
    async fn call(
        &self,
        endpoint: &Endpoint,
        method: Method,
        headers: HeaderMap,
        body: Bytes,
        timeout: Duration,
    ) -> Result<InvokerResponse, BoxError> {
        let url = endpoint.url()?;
        let connection = self.connection_for(&url).await?;

        let mut builder = http::Request::builder().method(method).uri(url.as_str());
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let request = builder.body(Full::new(body))?;

        let call = async {
            let mut sender = connection.sender.lock().await;
            let response = sender.send_request(request).await?;
            let (parts, body) = response.into_parts();
            let collected = body.collect().await?;
            Ok::<_, BoxError>((parts, collected.to_bytes()))
        };

        let (parts, body) = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| -> BoxError { "request timed out".into() })??;

        let content_type = parts
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(InvokerResponse {
            status_code: parts.status,
            headers: parts.headers,
            body,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoker_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HyperRequestInvoker>();
    }
}
