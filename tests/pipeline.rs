//! End-to-end tests driving a [`cluster_transport::Transport`] against a
//! [`cluster_transport::testing::ScriptedInvoker`] instead of real sockets,
//! covering the concrete failover/sniff/ping/resurrection scenarios the pool
//! and pipeline are built around.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{Method, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

use cluster_transport::clock::{SystemClock, TestClock};
use cluster_transport::product::{DefaultProductRegistration, ElasticsearchProductRegistration, StatusClass};
use cluster_transport::testing::{ScriptedInvoker, ScriptedResponse};
use cluster_transport::{
    AuditEvent, CloudTarget, Node, NodePool, ProductRegistration, RequestBody, RequestCompletedCallback,
    RequestDataCallback, Transport, TransportConfiguration,
};

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn events(trail: &[cluster_transport::AuditEntry]) -> Vec<AuditEvent> {
    trail.iter().map(|e| e.event).collect()
}

/// Delegates sniff parsing to [`ElasticsearchProductRegistration`] but opts
/// out of pinging, so the stale-cluster scenario below can isolate the sniff
/// path from the ping path.
struct SniffOnlyProduct {
    inner: ElasticsearchProductRegistration,
}

impl SniffOnlyProduct {
    fn new() -> Self {
        Self {
            inner: ElasticsearchProductRegistration::new("8.15.0"),
        }
    }
}

impl ProductRegistration for SniffOnlyProduct {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn product_version(&self) -> &str {
        self.inner.product_version()
    }

    fn supports_sniff(&self) -> bool {
        true
    }

    fn supports_ping(&self) -> bool {
        false
    }

    fn sniff_path(&self) -> &str {
        self.inner.sniff_path()
    }

    fn parse_sniff_response(&self, body: &[u8]) -> Result<Vec<Node>, anyhow::Error> {
        self.inner.parse_sniff_response(body)
    }

    fn http_status_code_classifier(&self, method: &Method, status: StatusCode) -> StatusClass {
        self.inner.http_status_code_classifier(method, status)
    }
}

#[tokio::test]
async fn happy_path_single_node() {
    let pool = NodePool::single(url("http://a:9200")).unwrap();
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.queue("http://a:9200/", ScriptedResponse::json(200, b"{\"ok\":true}"));

    let transport = Transport::builder(pool, Arc::new(DefaultProductRegistration::new("generic", "1.0")))
        .invoker(invoker)
        .build();

    let response = transport.request(Method::GET, "/", RequestBody::None, None, None).await;

    assert!(response.has_successful_status_code());
    assert_eq!(response.node_uri, "http://a:9200/");
    assert_eq!(events(&response.audit_trail), vec![AuditEvent::HealthyResponse]);
}

#[tokio::test]
async fn single_node_pool_does_not_retry_on_failure() {
    let pool = NodePool::single(url("http://a:9200")).unwrap();
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.queue("http://a:9200/", ScriptedResponse::status(502));

    let transport = Transport::builder(pool, Arc::new(DefaultProductRegistration::new("generic", "1.0")))
        .invoker(invoker)
        .build();

    let response = transport.request(Method::GET, "/", RequestBody::None, None, None).await;

    assert!(!response.has_successful_status_code());
    // the failed response's real status/node survive onto `TransportResponse`
    // rather than being replaced by a fabricated 500 (§4.4.7).
    assert_eq!(response.status_code, StatusCode::BAD_GATEWAY);
    assert_eq!(response.node_uri, "http://a:9200/");
    let exception = response.original_exception.expect("single failed node should surface an exception");
    assert!(matches!(exception.source, cluster_transport::PipelineError::BadResponse { .. }));
    assert_eq!(events(&exception.audit_trail), vec![AuditEvent::BadResponse]);
}

#[tokio::test]
async fn failover_after_502() {
    let pool = NodePool::sticky(vec![url("http://a:9200"), url("http://b:9200")]).unwrap();
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.queue("http://a:9200/", ScriptedResponse::status(502));
    invoker.queue("http://b:9200/", ScriptedResponse::json(200, b"{\"ok\":true}"));

    let initial_nodes: Vec<Arc<Node>> = pool.view(&SystemClock, None).map(|s| s.node).collect();
    assert_eq!(initial_nodes.len(), 2);

    let transport = Transport::builder(pool, Arc::new(DefaultProductRegistration::new("generic", "1.0")))
        .invoker(invoker)
        .build();

    let response = transport.request(Method::GET, "/", RequestBody::None, None, None).await;

    assert!(response.has_successful_status_code());
    assert_eq!(response.node_uri, "http://b:9200/");
    assert_eq!(events(&response.audit_trail), vec![AuditEvent::BadResponse, AuditEvent::HealthyResponse]);

    assert!(!initial_nodes[0].is_alive(&SystemClock), "node a should be marked dead after its 502");
    assert_eq!(initial_nodes[1].failed_attempts(), 0, "node b should be untouched by a's failure");
}

#[tokio::test]
async fn all_nodes_dead_then_resurrected() {
    let pool = NodePool::sticky(vec![url("http://a:9200"), url("http://b:9200")]).unwrap();
    let clock: Arc<TestClock> = Arc::new(TestClock::new());

    let nodes: Vec<Arc<Node>> = pool.view(clock.as_ref(), None).map(|s| s.node).collect();
    for node in &nodes {
        node.mark_dead(clock.as_ref(), None, None);
    }

    // With both nodes dead, `NodePool::view`'s all-dead fallback picks the
    // node at `global_cursor.rem_euclid(len)`; the cursor starts at -1, so
    // for a 2-node pool that resolves to index 1 ("b").
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.queue("http://b:9200/", ScriptedResponse::json(200, b"{\"ok\":true}"));

    let transport = Transport::builder(pool, Arc::new(DefaultProductRegistration::new("generic", "1.0")))
        .invoker(invoker)
        .clock(clock)
        .build();

    let response = transport.request(Method::GET, "/", RequestBody::None, None, None).await;

    assert!(response.has_successful_status_code());
    assert_eq!(response.node_uri, "http://b:9200/");
    assert_eq!(
        events(&response.audit_trail),
        vec![AuditEvent::AllNodesDead, AuditEvent::Resurrection, AuditEvent::HealthyResponse]
    );
}

#[tokio::test]
async fn stale_cluster_sniff_reseeds_before_the_call_completes() {
    let pool = NodePool::sticky_sniffing(vec![url("http://a:9200"), url("http://b:9200")], None).unwrap();
    let clock = Arc::new(TestClock::new());
    clock.advance(Duration::from_secs(120));

    let sniff_body = br#"{
        "nodes": {
            "n1": {
                "name": "node-1",
                "roles": ["data"],
                "http": {"publish_address": "127.0.0.1:9300"},
                "settings": {}
            }
        }
    }"#;

    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.queue("http://a:9200/", ScriptedResponse::json(200, sniff_body));
    invoker.queue("http://a:9200/", ScriptedResponse::json(200, b"{\"ok\":true}"));

    let mut config = TransportConfiguration::default();
    config.sniff_on_startup = false;
    config.sniff_lifespan = Some(Duration::from_secs(60));

    let transport = Transport::builder(pool, Arc::new(SniffOnlyProduct::new()))
        .invoker(invoker)
        .clock(clock)
        .config(config)
        .build();

    let response = transport.request(Method::GET, "/", RequestBody::None, None, None).await;

    assert!(response.has_successful_status_code());
    assert_eq!(
        events(&response.audit_trail),
        vec![AuditEvent::SniffOnStaleCluster, AuditEvent::SniffSuccess, AuditEvent::HealthyResponse]
    );
}

#[tokio::test]
async fn ping_failure_triggers_sniff_then_fails_over() {
    let pool = NodePool::sticky_sniffing(vec![url("http://a:9200"), url("http://b:9200")], None).unwrap();

    // Reseeds to two nodes, not one: the retry budget is recomputed against
    // the *current* pool size, so a reseed down to a single node here would
    // make `attempts(1) > effectiveMaxRetries(0)` trip `MaxRetriesReached`
    // before node b ever gets a turn.
    let sniff_body = br#"{
        "nodes": {
            "n1": {
                "name": "node-1",
                "roles": ["data"],
                "http": {"publish_address": "127.0.0.1:9300"},
                "settings": {}
            },
            "n2": {
                "name": "node-2",
                "roles": ["data"],
                "http": {"publish_address": "127.0.0.1:9301"},
                "settings": {}
            }
        }
    }"#;

    // A failed ping marks its node dead before the connection-fault sniff
    // runs, so the sniff view excludes `a` and lands on `b` — script the
    // sniff-success body there, not on `a`.
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.queue("http://a:9200/", ScriptedResponse::status(503));
    invoker.queue("http://b:9200/", ScriptedResponse::json(200, sniff_body));
    invoker.queue("http://b:9200/", ScriptedResponse::status(200));
    invoker.queue("http://b:9200/", ScriptedResponse::json(200, b"{\"ok\":true}"));

    let mut config = TransportConfiguration::default();
    config.sniff_on_startup = false;

    let transport = Transport::builder(pool, Arc::new(ElasticsearchProductRegistration::new("8.15.0")))
        .invoker(invoker)
        .config(config)
        .build();

    let response = transport.request(Method::GET, "/", RequestBody::None, None, None).await;

    assert!(response.has_successful_status_code());
    assert_eq!(response.node_uri, "http://b:9200/");
    assert_eq!(
        events(&response.audit_trail),
        vec![
            AuditEvent::PingFailure,
            AuditEvent::SniffOnFail,
            AuditEvent::SniffSuccess,
            AuditEvent::PingSuccess,
            AuditEvent::HealthyResponse,
        ]
    );
}

#[tokio::test]
async fn max_retry_timeout_short_circuits_before_every_node_is_tried() {
    let pool = NodePool::sticky(vec![url("http://a:9200"), url("http://b:9200")]).unwrap();
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.queue("http://a:9200/", ScriptedResponse::status(502));
    // node b is deliberately left unscripted: if the pipeline attempted it
    // despite the retry-timeout budget being exhausted, ScriptedInvoker would
    // panic rather than this assertion silently passing.

    let mut config = TransportConfiguration::default();
    config.max_retry_timeout = Some(Duration::from_nanos(1));

    let transport = Transport::builder(pool, Arc::new(DefaultProductRegistration::new("generic", "1.0")))
        .invoker(invoker)
        .config(config)
        .build();

    let response = transport.request(Method::GET, "/", RequestBody::None, None, None).await;

    assert!(!response.has_successful_status_code());
    let exception = response.original_exception.expect("exhausted retry-timeout budget should surface an exception");
    assert!(matches!(exception.source, cluster_transport::PipelineError::MaxTimeoutReached { attempts: 1 }));
    assert_eq!(exception.audit_trail.last().map(|e| e.event), Some(AuditEvent::MaxTimeoutReached));
}

#[tokio::test]
async fn cancellation_before_dispatch_short_circuits_with_no_network_calls() {
    let pool = NodePool::single(url("http://a:9200")).unwrap();
    let invoker = Arc::new(ScriptedInvoker::new());
    // left empty: cancellation must be observed before any call is made.

    let transport = Transport::builder(pool, Arc::new(DefaultProductRegistration::new("generic", "1.0")))
        .invoker(invoker)
        .build();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let response = transport
        .request(Method::GET, "/", RequestBody::None, None, Some(cancel))
        .await;

    assert!(!response.has_successful_status_code());
    let exception = response.original_exception.expect("a cancelled call should surface an exception");
    assert!(matches!(exception.source, cluster_transport::PipelineError::CancellationRequested));
    assert_eq!(events(&exception.audit_trail), vec![AuditEvent::CancellationRequested]);
}

#[tokio::test]
async fn observability_callbacks_fire_around_a_failed_attempt() {
    let pool = NodePool::single(url("http://a:9200")).unwrap();
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.queue("http://a:9200/", ScriptedResponse::status(503));

    let data_created_count = Arc::new(AtomicUsize::new(0));
    let completed_details = Arc::new(Mutex::new(None));

    let mut config = TransportConfiguration::default();
    let counter = data_created_count.clone();
    config.on_request_data_created = Some(RequestDataCallback(Arc::new(move |data| {
        assert_eq!(data.node_uri, "http://a:9200/");
        counter.fetch_add(1, Ordering::SeqCst);
    })));
    let captured = completed_details.clone();
    config.on_request_completed = Some(RequestCompletedCallback(Arc::new(move |details| {
        *captured.lock().unwrap() = Some(details.clone());
    })));

    let transport = Transport::builder(pool, Arc::new(DefaultProductRegistration::new("generic", "1.0")))
        .invoker(invoker)
        .config(config)
        .build();

    let response = transport.request(Method::GET, "/", RequestBody::None, None, None).await;

    assert!(!response.has_successful_status_code());
    assert_eq!(data_created_count.load(Ordering::SeqCst), 1);

    let details = completed_details.lock().unwrap().clone().expect("onRequestCompleted should have fired");
    assert!(!details.success);
    assert_eq!(details.http_status_code, Some(503));
    assert_eq!(details.node_uri.as_deref(), Some("http://a:9200/"));
}

#[tokio::test]
async fn cloud_id_pool_targets_the_decoded_elasticsearch_uri() {
    // base64("elastic.cloud$uuid1$uuid2"), the same fixture the cloud-id unit
    // tests decode.
    let pool = NodePool::cloud("cluster:ZWxhc3RpYy5jbG91ZCR1dWlkMSR1dWlkMg==", CloudTarget::Elasticsearch).unwrap();

    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.queue("https://uuid1.elastic.cloud/", ScriptedResponse::json(200, b"{\"ok\":true}"));

    let transport = Transport::builder(pool, Arc::new(DefaultProductRegistration::new("generic", "1.0")))
        .invoker(invoker)
        .build();

    let response = transport.request(Method::GET, "/", RequestBody::None, None, None).await;

    assert!(response.has_successful_status_code());
    assert_eq!(response.node_uri, "https://uuid1.elastic.cloud/");
}
