//! Cluster invalidation propagator.
//!
//! A node broadcasts "these ids changed" for a scope; every other node
//! accumulates what it receives and drains it with
//! [`InvalidationPropagator::receive_invalidations`].  Wire format on topic
//! `inval:<scope>`: `<origin>:ALL` or `<origin>:<id>,<id>,...`.
//!
//! Each node also keeps a liveness field in `<ns>inval:<scope>:nodes`
//! (node id -> epoch millis), refreshed on every send and by a heartbeat.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::InvalidationConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::namespace::{Namespace, Subsystem};
use crate::node::{check_node_id, now_millis};
use crate::pubsub::{ClusterMessage, HandlerId, MessageHandler, PubSubDispatcher};
use crate::store::memory::Db;
use crate::store::{arg, arg_i64, arg_str, key, Backend, Reply, Script};

const ALL: &str = "ALL";
const ID_DELIMITER: char = ',';

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// A set of invalidated ids, or "everything".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidations {
    pub all: bool,
    pub ids: BTreeSet<String>,
}

impl Invalidations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            all: true,
            ids: BTreeSet::new(),
        }
    }

    pub fn of<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut batch = Self::new();
        for id in ids {
            batch.add(id);
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.ids.is_empty()
    }

    pub fn add(&mut self, id: impl Into<String>) {
        if !self.all {
            self.ids.insert(id.into());
        }
    }

    /// Everything is invalid; individual ids no longer matter.
    pub fn add_all(&mut self) {
        self.all = true;
        self.ids.clear();
    }

    pub fn merge(&mut self, other: Invalidations) {
        if other.all {
            self.add_all();
        } else if !self.all {
            self.ids.extend(other.ids);
        }
    }

    fn encode_body(&self) -> Result<String> {
        if self.all {
            return Ok(ALL.to_string());
        }
        if let Some(bad) = self.ids.iter().find(|id| id.contains(ID_DELIMITER)) {
            return Err(Error::contract(format!(
                "invalidation id {bad:?} contains {ID_DELIMITER:?}"
            )));
        }
        // A lone `ALL` id would read back as the invalidate-all marker.
        if self.ids.contains(ALL) {
            return Err(Error::contract(format!(
                "invalidation id {ALL:?} is reserved; use Invalidations::all()"
            )));
        }
        Ok(self
            .ids
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(","))
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let body = std::str::from_utf8(body)
            .map_err(|_| Error::contract("invalidation body is not valid UTF-8"))?;
        if body == ALL {
            return Ok(Self::all());
        }
        Ok(Self::of(body.split(ID_DELIMITER).filter(|id| !id.is_empty())))
    }
}

/// `<origin>:<body>` for a batch sent by `origin`.
pub fn encode_message(origin: &str, batch: &Invalidations) -> Result<String> {
    Ok(format!("{origin}:{}", batch.encode_body()?))
}

/// Split a message at the first `:` into origin and encoded body, without
/// looking at the body.
pub fn split_origin(payload: &[u8]) -> Result<(&str, &[u8])> {
    let at = payload
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| Error::contract("invalidation message without origin"))?;
    let origin = std::str::from_utf8(&payload[..at])
        .map_err(|_| Error::contract("invalidation origin is not valid UTF-8"))?;
    Ok((origin, &payload[at + 1..]))
}

/// Decode a full `<origin>:<body>` message.
pub fn decode_message(payload: &[u8]) -> Result<(String, Invalidations)> {
    let (origin, body) = split_origin(payload)?;
    Ok((origin.to_string(), Invalidations::decode_body(body)?))
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// KEYS: nodes.  ARGV: node, now millis, node ttl.
static HEARTBEAT: Script = Script {
    name: "inval_heartbeat",
    lua: r#"
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
        redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
        return 1
    "#,
    local: heartbeat_local,
};

fn heartbeat_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let nodes = key(keys, 0)?;
    db.hset(nodes, arg_str(args, 0)?, arg(args, 1)?.clone())?;
    db.expire(nodes, arg_ttl(args, 2)?);
    Ok(Reply::Int(1))
}

/// KEYS: nodes.  ARGV: node, now millis, node ttl, channel, message.
static SEND: Script = Script {
    name: "inval_send",
    lua: r#"
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
        redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
        redis.call('PUBLISH', ARGV[4], ARGV[5])
        return 1
    "#,
    local: send_local,
};

fn send_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    heartbeat_local(db, keys, args)?;
    db.publish(arg_str(args, 3)?, arg(args, 4)?.clone());
    Ok(Reply::Int(1))
}

fn arg_ttl(args: &[Bytes], index: usize) -> Result<u64> {
    u64::try_from(arg_i64(args, index)?)
        .map_err(|_| Error::Backend(format!("script argument {} is negative", index + 1)))
}

// ---------------------------------------------------------------------------
// Receiving side
// ---------------------------------------------------------------------------

struct Listener {
    node_id: String,
    pending: Arc<Mutex<Invalidations>>,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl MessageHandler for Listener {
    async fn handle(&self, message: &ClusterMessage) {
        let ClusterMessage::Invalidation {
            scope,
            origin,
            body,
        } = message
        else {
            return;
        };
        if *origin == self.node_id {
            trace!(%scope, "ignoring own invalidations");
            return;
        }
        match Invalidations::decode_body(body) {
            Ok(batch) => {
                debug!(%scope, %origin, all = batch.all, ids = batch.ids.len(), "invalidations received");
                self.metrics.invalidations_received.inc();
                self.pending.lock().merge(batch);
            }
            Err(e) => warn!(%scope, %origin, error = %e, "dropping malformed invalidations"),
        }
    }
}

// ---------------------------------------------------------------------------
// Propagator
// ---------------------------------------------------------------------------

pub struct InvalidationPropagator {
    backend: Arc<dyn Backend>,
    dispatcher: Arc<PubSubDispatcher>,
    ns: Namespace,
    node_id: String,
    scope: String,
    node_ttl: Duration,
    pending: Arc<Mutex<Invalidations>>,
    handler: HandlerId,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

impl InvalidationPropagator {
    /// Register this node for `scope` and start listening.
    ///
    /// With a degraded dispatcher the node keeps sending but cannot receive
    /// until it is restarted; this is logged, not returned as an error.
    pub async fn initialize(
        backend: Arc<dyn Backend>,
        dispatcher: Arc<PubSubDispatcher>,
        ns: Namespace,
        node_id: &str,
        scope: &str,
        config: &InvalidationConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        check_node_id(node_id)?;
        if scope.is_empty() || scope.contains(':') {
            return Err(Error::contract(format!(
                "invalidation scope {scope:?} must be non-empty and must not contain ':'"
            )));
        }

        let pending = Arc::new(Mutex::new(Invalidations::new()));
        let handler = dispatcher.subscribe(
            &topic(scope),
            Arc::new(Listener {
                node_id: node_id.to_string(),
                pending: Arc::clone(&pending),
                metrics: Arc::clone(&metrics),
            }),
        );

        let propagator = Self {
            backend,
            dispatcher,
            ns,
            node_id: node_id.to_string(),
            scope: scope.to_string(),
            node_ttl: Duration::from_secs(config.node_ttl_secs),
            pending,
            handler,
            heartbeat: Mutex::new(None),
            metrics,
        };
        if let Err(e) = propagator.beat().await {
            propagator.dispatcher.unsubscribe(&topic(scope), handler);
            return Err(e);
        }

        let interval = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        *propagator.heartbeat.lock() = Some(tokio::spawn(run_heartbeat(
            HeartbeatTick {
                backend: Arc::clone(&propagator.backend),
                nodes_key: propagator.nodes_key(),
                node_id: propagator.node_id.clone(),
                node_ttl_secs: config.node_ttl_secs,
                metrics: Arc::clone(&propagator.metrics),
            },
            interval,
        )));

        if propagator.dispatcher.is_subscribed() {
            info!(%scope, %node_id, "invalidation propagator initialised");
        } else {
            warn!(%scope, %node_id, "pubsub unavailable, invalidations from other nodes will be missed");
        }
        Ok(propagator)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn nodes_key(&self) -> String {
        self.ns.key_part(Subsystem::Inval, &self.scope, "nodes")
    }

    async fn beat(&self) -> Result<()> {
        HeartbeatTick {
            backend: Arc::clone(&self.backend),
            nodes_key: self.nodes_key(),
            node_id: self.node_id.clone(),
            node_ttl_secs: self.node_ttl.as_secs(),
            metrics: Arc::clone(&self.metrics),
        }
        .run()
        .await
    }

    /// Broadcast `batch` to every other node and refresh this node's
    /// liveness in the same script.  An empty batch is not sent.
    pub async fn send_invalidations(&self, batch: &Invalidations) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let message = encode_message(&self.node_id, batch)?;
        self.backend
            .eval(
                &SEND,
                vec![self.nodes_key()],
                vec![
                    Bytes::from(self.node_id.clone()),
                    Bytes::from(now_millis().to_string()),
                    Bytes::from(self.node_ttl.as_secs().to_string()),
                    Bytes::from(self.ns.channel(&topic(&self.scope))),
                    Bytes::from(message),
                ],
            )
            .await?;
        self.metrics.invalidations_sent.inc();
        debug!(scope = %self.scope, all = batch.all, ids = batch.ids.len(), "invalidations sent");
        Ok(())
    }

    /// Everything received since the previous call.  The buffer is reset.
    pub fn receive_invalidations(&self) -> Invalidations {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Nodes whose last heartbeat is younger than the node TTL, sorted.
    pub async fn active_nodes(&self) -> Result<Vec<String>> {
        let cutoff = now_millis() - self.node_ttl.as_millis() as i64;
        let nodes = self.backend.hgetall(&self.nodes_key()).await?;
        let mut active: Vec<String> = nodes
            .into_iter()
            .filter(|(_, seen)| {
                std::str::from_utf8(seen)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .is_some_and(|ms| ms >= cutoff)
            })
            .map(|(node, _)| node)
            .collect();
        active.sort();
        Ok(active)
    }

    /// Stop the heartbeat, stop listening and deregister this node.
    pub async fn close(&self) -> Result<()> {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.abort();
        }
        self.dispatcher
            .unsubscribe(&topic(&self.scope), self.handler);
        self.backend.hdel(&self.nodes_key(), &self.node_id).await?;
        info!(scope = %self.scope, node_id = %self.node_id, "invalidation propagator closed");
        Ok(())
    }
}

impl Drop for InvalidationPropagator {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            heartbeat.abort();
        }
    }
}

fn topic(scope: &str) -> String {
    format!("inval:{scope}")
}

struct HeartbeatTick {
    backend: Arc<dyn Backend>,
    nodes_key: String,
    node_id: String,
    node_ttl_secs: u64,
    metrics: Arc<Metrics>,
}

impl HeartbeatTick {
    async fn run(&self) -> Result<()> {
        self.backend
            .eval(
                &HEARTBEAT,
                vec![self.nodes_key.clone()],
                vec![
                    Bytes::from(self.node_id.clone()),
                    Bytes::from(now_millis().to_string()),
                    Bytes::from(self.node_ttl_secs.to_string()),
                ],
            )
            .await?;
        trace!(key = %self.nodes_key, "heartbeat tick");
        Ok(())
    }
}

async fn run_heartbeat(tick: HeartbeatTick, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; registration already happened.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = tick.run().await {
            tick.metrics.store_errors.inc();
            error!(error = %e, node_id = %tick.node_id, "heartbeat tick failed");
        }
    }
}
