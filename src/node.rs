//! Endpoint identity, feature tags, and the per-node liveness model.
//!
//! A `Node` is owned by exactly one [`crate::pool::NodePool`]; only the pool
//! (via [`Node::mark_alive`] / [`Node::mark_dead`]) mutates its liveness
//! fields. `failed_attempts` and `dead_until` are plain atomics rather than
//! a lock so that marking one node alive or dead never contends with
//! iteration of the others.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use url::Url;

use crate::clock::Clock;

/// A feature tag attached to a node, e.g. `"master_eligible"`, `"data"`,
/// `"http"`. Kept as a string set rather than an exhaustive enum so new
/// product-specific tags never require a breaking change here.
pub type NodeFeature = String;

/// An addressable backend endpoint: scheme + host + port, plus whatever
/// metadata the pool or a sniff response attached to it.
#[derive(Debug)]
pub struct Node {
    /// Absolute base URI of this node, e.g. `https://10.0.0.1:9200`.
    uri: Url,
    /// Optional cluster-assigned node id (present after a sniff).
    pub id: Option<String>,
    /// Optional human-readable node name.
    pub name: Option<String>,
    /// Feature tags such as master-eligible, holds-data, http-enabled.
    pub features: HashSet<NodeFeature>,
    /// Arbitrary key/value settings carried over from a sniff response.
    pub settings: HashMap<String, String>,
    /// Number of consecutive failed calls since the last success.
    failed_attempts: AtomicU32,
    /// Millis since `epoch` before which this node is considered dead.
    /// `0` means "not dead" (alive).
    dead_until_millis: AtomicU64,
    /// Epoch instant `dead_until_millis` is relative to. Fixed at
    /// construction so liveness comparisons stay monotonic even though
    /// `AtomicU64` cannot store an `Instant` directly.
    epoch: Instant,
}

// `is_resurrected` is deliberately *not* a field here: it is a property of
// one particular view's selection of a node, not of the node itself, and
// making it node-owned mutable state would race across concurrent calls
// that observe the same node. See `pool::NodeSelection`.

impl Node {
    /// Creates a new, alive node from its base URI.
    pub fn new(uri: Url) -> Self {
        Self {
            uri,
            id: None,
            name: None,
            features: HashSet::new(),
            settings: HashMap::new(),
            failed_attempts: AtomicU32::new(0),
            dead_until_millis: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Creates a node with an id, name and feature set, as produced when
    /// parsing a sniff response.
    pub fn with_metadata(
        uri: Url,
        id: Option<String>,
        name: Option<String>,
        features: HashSet<NodeFeature>,
        settings: HashMap<String, String>,
    ) -> Self {
        let mut node = Self::new(uri);
        node.id = id;
        node.name = name;
        node.features = features;
        node.settings = settings;
        node
    }

    /// The node's base URI.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// True iff this node's scheme is `https`.
    pub fn uses_ssl(&self) -> bool {
        self.uri.scheme() == "https"
    }

    /// The node's URI with any userinfo component redacted, for safe
    /// inclusion in audit trails and error messages.
    pub fn redacted_uri(&self) -> String {
        let mut redacted = self.uri.clone();
        if !redacted.username().is_empty() {
            let _ = redacted.set_username("redacted");
        }
        if redacted.password().is_some() {
            let _ = redacted.set_password(Some("redacted"));
        }
        redacted.to_string()
    }

    /// Number of consecutive failures since the last success.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::SeqCst)
    }

    /// `true` iff `dead_until <= now` (the node may be targeted by a view).
    pub fn is_alive(&self, clock: &dyn Clock) -> bool {
        let dead_until = self.dead_until_millis.load(Ordering::SeqCst);
        if dead_until == 0 {
            return true;
        }
        let now_millis = clock.now().duration_since(self.epoch).as_millis() as u64;
        now_millis >= dead_until
    }

    /// `true` iff this node currently carries a non-zero `dead_until` that
    /// has since elapsed — i.e. it is alive again after having been marked
    /// dead, and a view selecting it should flag it as a resurrection.
    pub fn is_pending_resurrection(&self) -> bool {
        self.dead_until_millis.load(Ordering::SeqCst) != 0
    }

    /// Records a successful call: resets `failed_attempts` and clears
    /// `dead_until` (invariant 4, §3).
    pub fn mark_alive(&self) {
        self.failed_attempts.store(0, Ordering::SeqCst);
        self.dead_until_millis.store(0, Ordering::SeqCst);
    }

    /// Records a failed call: increments `failed_attempts` and sets
    /// `dead_until` via the clock's backoff formula (invariant 5, §3).
    pub fn mark_dead(
        &self,
        clock: &dyn Clock,
        min_timeout: Option<Duration>,
        max_timeout: Option<Duration>,
    ) {
        let attempts = self.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let dead_until = clock.dead_time(attempts, min_timeout, max_timeout);
        let millis = dead_until.duration_since(self.epoch).as_millis() as u64;
        self.dead_until_millis.store(millis, Ordering::SeqCst);
    }
}
