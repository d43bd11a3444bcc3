//! The node pool: an ordered, possibly-mutable set of [`Node`]s and the
//! strategies that decide how a call iterates over them.
//!
//! Polymorphism here is deliberately narrow — the variation between Single/
//! Static/Sniffing/Sticky/StickySniffing/Cloud is entirely captured by two
//! concerns: whether the pool supports reseeding, and whether its iteration
//! order rotates or stays sticky to the first healthy node. Rather than one
//! struct per strategy we use a single [`NodePool`] tagged by [`Strategy`],
//! preferring tagged variants over a class hierarchy.

pub mod cloud_id;

use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use url::Url;

use crate::audit::{AuditEvent, Auditor};
use crate::clock::Clock;
use crate::node::Node;

pub use cloud_id::{CloudId, CloudTarget};

/// Errors raised constructing or reseeding a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("node pool must contain at least one node")]
    EmptyNodeList,
    #[error("node pool cannot mix http and https schemes across nodes")]
    MixedSchemes,
    #[error("reseed was given an empty node list; keeping the existing node set")]
    EmptyReseed,
    #[error("this pool strategy does not support reseeding")]
    ReseedNotSupported,
    #[error("invalid cloud id: {0}")]
    CloudId(String),
}

/// The pool's iteration/reseed strategy. Each variant's distinguishing
/// behavior reduces to `supports_pinging`, `supports_reseeding`, and
/// sticky-vs-rotating iteration order, all stored directly on [`NodePool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Single,
    Static,
    Sniffing,
    Sticky,
    StickySniffing,
    Cloud,
}

/// A caller-supplied scoring function used by `StickySniffing` to sort
/// candidate nodes in descending order before applying the sticky
/// first-alive rule.
pub type NodeScorer = Arc<dyn Fn(&Node) -> i64 + Send + Sync>;

/// One node yielded from a [`NodeView`], annotated with whether the pool
/// picked it as a resurrection (its backoff had expired, or it was the last
/// resort chosen from an all-dead pool).
pub struct NodeSelection {
    pub node: Arc<Node>,
    pub is_resurrected: bool,
}

/// A lazy, deterministic iteration order over the alive subset of a pool,
/// produced by [`NodePool::view`]. The rotation order is computed once, up
/// front, from a single atomic snapshot of the node list (so concurrent
/// reseeds never produce a mixed view) — but resurrection bookkeeping and
/// its audit entry happen lazily, one node at a time, as the pipeline
/// actually consumes them.
pub struct NodeView<'a> {
    items: std::vec::IntoIter<Arc<Node>>,
    auditor: Option<&'a Auditor>,
}

impl<'a> Iterator for NodeView<'a> {
    type Item = NodeSelection;

    fn next(&mut self) -> Option<NodeSelection> {
        let node = self.items.next()?;
        let is_resurrected = node.is_pending_resurrection();
        if is_resurrected {
            if let Some(auditor) = self.auditor {
                auditor.emit(AuditEvent::Resurrection, Some(node.redacted_uri()));
            }
        }
        Some(NodeSelection { node, is_resurrected })
    }
}

/// The ordered, possibly-mutable set of nodes a call may choose from.
pub struct NodePool {
    strategy: Strategy,
    nodes: ArcSwap<Vec<Arc<Node>>>,
    global_cursor: AtomicIsize,
    epoch: Instant,
    last_update_millis: AtomicU64,
    supports_pinging: bool,
    supports_reseeding: bool,
    using_ssl: bool,
    scorer: Option<NodeScorer>,
    /// Guards the "has this pool completed its first-use sniff" flag.
    sniffed_on_startup: tokio::sync::Mutex<bool>,
    /// Held for the duration of an in-flight sniff so concurrent callers
    /// that observe a stale cluster coalesce onto one network call.
    sniff_lock: tokio::sync::Mutex<()>,
}

impl NodePool {
    fn build(
        nodes: Vec<Node>,
        strategy: Strategy,
        supports_pinging: bool,
        supports_reseeding: bool,
        scorer: Option<NodeScorer>,
    ) -> Result<Self, PoolError> {
        if nodes.is_empty() {
            return Err(PoolError::EmptyNodeList);
        }
        let using_ssl = validate_uniform_scheme(&nodes)?;
        let epoch = Instant::now();
        Ok(Self {
            strategy,
            nodes: ArcSwap::from_pointee(nodes.into_iter().map(Arc::new).collect()),
            global_cursor: AtomicIsize::new(-1),
            epoch,
            last_update_millis: AtomicU64::new(0),
            supports_pinging,
            supports_reseeding,
            using_ssl,
            scorer,
            sniffed_on_startup: tokio::sync::Mutex::new(false),
            sniff_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// A single, non-reseeding, non-pinging node. `max_retries() == 0`.
    pub fn single(uri: Url) -> Result<Self, PoolError> {
        Self::build(vec![Node::new(uri)], Strategy::Single, false, false, None)
    }

    /// A fixed list of nodes in randomized order (fresh `thread_rng` seed).
    /// `max_retries() == nodes.len() - 1`.
    pub fn static_pool(uris: Vec<Url>) -> Result<Self, PoolError> {
        let mut nodes: Vec<Node> = uris.into_iter().map(Node::new).collect();
        nodes.shuffle(&mut rand::thread_rng());
        Self::build(nodes, Strategy::Static, true, false, None)
    }

    /// Like [`Self::static_pool`] but with a caller-supplied RNG seed, so
    /// tests get a deterministic node order.
    pub fn static_pool_seeded(uris: Vec<Url>, seed: u64) -> Result<Self, PoolError> {
        let mut nodes: Vec<Node> = uris.into_iter().map(Node::new).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        nodes.shuffle(&mut rng);
        Self::build(nodes, Strategy::Static, true, false, None)
    }

    /// Extends `Static` with atomic, lock-guarded reseeding from a sniff.
    pub fn sniffing(uris: Vec<Url>) -> Result<Self, PoolError> {
        let mut nodes: Vec<Node> = uris.into_iter().map(Node::new).collect();
        nodes.shuffle(&mut rand::thread_rng());
        Self::build(nodes, Strategy::Sniffing, true, true, None)
    }

    /// Extends `Static`; iteration never rotates, staying on the first
    /// currently alive node.
    pub fn sticky(uris: Vec<Url>) -> Result<Self, PoolError> {
        let nodes: Vec<Node> = uris.into_iter().map(Node::new).collect();
        Self::build(nodes, Strategy::Sticky, true, false, None)
    }

    /// `Sniffing` + sticky iteration order, optionally weighted by a
    /// caller-supplied [`NodeScorer`] for descending sort.
    pub fn sticky_sniffing(uris: Vec<Url>, scorer: Option<NodeScorer>) -> Result<Self, PoolError> {
        let nodes: Vec<Node> = uris.into_iter().map(Node::new).collect();
        Self::build(nodes, Strategy::StickySniffing, true, true, scorer)
    }

    /// A single node derived from an Elastic Cloud ID (§4.2).
    pub fn cloud(cloud_id: &str, target: CloudTarget) -> Result<Self, PoolError> {
        let decoded = CloudId::decode(cloud_id)?;
        let uri = decoded.uri_for(target)?;
        Self::build(vec![Node::new(uri)], Strategy::Cloud, false, false, None)
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn supports_pinging(&self) -> bool {
        self.supports_pinging
    }

    pub fn supports_reseeding(&self) -> bool {
        self.supports_reseeding
    }

    pub fn using_ssl(&self) -> bool {
        self.using_ssl
    }

    fn is_sticky(&self) -> bool {
        matches!(self.strategy, Strategy::Sticky | Strategy::StickySniffing)
    }

    /// Current node count (may change across a reseed).
    pub fn node_count(&self) -> usize {
        self.nodes.load().len()
    }

    pub fn is_single_node(&self) -> bool {
        self.node_count() == 1
    }

    /// `nodes.len() - 1`, recomputed against the current node list so a
    /// reseed takes effect on the next call.
    pub fn max_retries(&self) -> usize {
        self.node_count().saturating_sub(1)
    }

    pub fn last_update(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_update_millis.load(Ordering::SeqCst))
    }

    /// `true` iff this pool has never completed a sniff and the caller
    /// should run the first-use bootstrap sniff (§4.4.1).
    pub async fn needs_startup_sniff(&self) -> bool {
        !*self.sniffed_on_startup.lock().await
    }

    /// Marks the startup sniff complete, regardless of outcome. Released
    /// unconditionally — a failed first sniff does not retry the bootstrap;
    /// the stale-cluster check will re-sniff when appropriate.
    pub async fn mark_sniffed_on_startup(&self) {
        *self.sniffed_on_startup.lock().await = true;
    }

    /// The lock callers hold for the duration of an in-flight sniff, so
    /// concurrent requests that observe a stale cluster coalesce onto one
    /// network call (§5).
    pub fn sniff_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.sniff_lock
    }

    /// The single process-wide first-use semaphore (§4.4.1): held across the
    /// whole bootstrap sniff attempt so concurrent first callers serialize
    /// onto one sniff, and released unconditionally regardless of outcome.
    pub async fn lock_startup_sniff(&self) -> tokio::sync::MutexGuard<'_, bool> {
        self.sniffed_on_startup.lock().await
    }

    /// Atomically replaces the node list. Rejects reseeding a strategy that
    /// does not support it, and rejects an empty replacement list (the
    /// open question in §9: sniff never partially merges, and an empty
    /// sniff result is a rejected reseed, not a wipe of the pool).
    pub fn reseed(&self, nodes: Vec<Node>) -> Result<(), PoolError> {
        if !self.supports_reseeding {
            return Err(PoolError::ReseedNotSupported);
        }
        if nodes.is_empty() {
            return Err(PoolError::EmptyReseed);
        }
        validate_uniform_scheme(&nodes)?;
        let wrapped: Vec<Arc<Node>> = nodes.into_iter().map(Arc::new).collect();
        self.nodes.store(Arc::new(wrapped));
        self.global_cursor.store(-1, Ordering::SeqCst);
        let millis = Instant::now().duration_since(self.epoch).as_millis() as u64;
        self.last_update_millis.store(millis, Ordering::SeqCst);
        Ok(())
    }

    /// Produces an iteration view over the pool's alive subset (§4.2).
    pub fn view<'a>(&self, clock: &dyn Clock, auditor: Option<&'a Auditor>) -> NodeView<'a> {
        let guard = self.nodes.load();
        let snapshot: &Vec<Arc<Node>> = &guard;

        let alive: Vec<Arc<Node>> = snapshot
            .iter()
            .filter(|n| n.is_alive(clock))
            .cloned()
            .collect();

        if alive.is_empty() {
            if let Some(auditor) = auditor {
                auditor.emit(AuditEvent::AllNodesDead, None);
            }
            let cursor = self.global_cursor.load(Ordering::SeqCst);
            let len = snapshot.len() as isize;
            let idx = cursor.rem_euclid(len) as usize;
            let chosen = snapshot[idx].clone();
            return NodeView {
                items: vec![chosen].into_iter(),
                auditor,
            };
        }

        let ordered: Vec<Arc<Node>> = if self.is_sticky() {
            let mut v = alive;
            if let Some(scorer) = &self.scorer {
                v.sort_by_key(|n| std::cmp::Reverse(scorer(n)));
            }
            v
        } else {
            let cursor = self.global_cursor.fetch_add(1, Ordering::SeqCst) + 1;
            let len = alive.len();
            let start = cursor.rem_euclid(len as isize) as usize;
            (0..len).map(|step| alive[(start + step) % len].clone()).collect()
        };

        NodeView {
            items: ordered.into_iter(),
            auditor,
        }
    }
}

fn validate_uniform_scheme(nodes: &[Node]) -> Result<bool, PoolError> {
    let mut saw_https = false;
    let mut saw_http = false;
    for node in nodes {
        if node.uses_ssl() {
            saw_https = true;
        } else {
            saw_http = true;
        }
    }
    if saw_https && saw_http {
        return Err(PoolError::MixedSchemes);
    }
    Ok(saw_https)
}
