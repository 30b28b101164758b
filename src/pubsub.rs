//! Pub/sub dispatcher.
//!
//! One subscriber task owns the dedicated pattern subscription on
//! `<ns>pubsub:*`.  It only decodes messages and routes them; handlers run
//! on a fixed set of worker tasks, so a handler talking to the store can
//! never stall the subscription.  A message goes to the worker picked by a
//! hash of its topic, which keeps messages of one topic in arrival order.
//! The subscriber never waits on a worker: when a worker's queue is full
//! the message is dropped and counted.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::PubSubConfig;
use crate::error::{Error, Result};
use crate::invalidation;
use crate::metrics::{MessageKind, MessageLabels, Metrics};
use crate::namespace::Namespace;
use crate::store::{Backend, ChannelMessage, Subscription};

/// Topic of the sentinel a node publishes to stop its own subscriber loop.
pub const SHUTDOWN_TOPIC: &str = "__shutdown__";

const INVALIDATION_TOPIC_PREFIX: &str = "inval:";
const LOCK_TOPIC_PREFIX: &str = "lock:";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Every kind of message carried over the cluster channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMessage {
    /// An invalidation batch for `scope`.  `body` is left encoded so that a
    /// node can drop its own batches after reading only the origin.
    Invalidation {
        scope: String,
        origin: String,
        body: Bytes,
    },
    /// `owner` released the lock on `resource`.
    LockReleased { resource: String, owner: String },
    /// The subscriber loop of node `origin` is stopping.
    Shutdown { origin: String },
    /// Any other application topic.
    Topic { topic: String, payload: Bytes },
}

impl ClusterMessage {
    /// Decode a message received on `topic`.
    pub fn decode(topic: &str, payload: Bytes) -> Result<Self> {
        if let Some(scope) = topic.strip_prefix(INVALIDATION_TOPIC_PREFIX) {
            let (origin, body) = invalidation::split_origin(&payload)?;
            return Ok(Self::Invalidation {
                scope: scope.to_string(),
                origin: origin.to_string(),
                body: payload.slice_ref(body),
            });
        }
        if let Some(resource) = topic.strip_prefix(LOCK_TOPIC_PREFIX) {
            return Ok(Self::LockReleased {
                resource: resource.to_string(),
                owner: text(&payload)?,
            });
        }
        if topic == SHUTDOWN_TOPIC {
            return Ok(Self::Shutdown {
                origin: text(&payload)?,
            });
        }
        Ok(Self::Topic {
            topic: topic.to_string(),
            payload,
        })
    }

    /// Topic the message was published on; handlers are registered by it.
    pub fn topic(&self) -> String {
        match self {
            Self::Invalidation { scope, .. } => format!("{INVALIDATION_TOPIC_PREFIX}{scope}"),
            Self::LockReleased { resource, .. } => format!("{LOCK_TOPIC_PREFIX}{resource}"),
            Self::Shutdown { .. } => SHUTDOWN_TOPIC.to_string(),
            Self::Topic { topic, .. } => topic.clone(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Invalidation { .. } => MessageKind::Invalidation,
            Self::LockReleased { .. } => MessageKind::LockReleased,
            Self::Shutdown { .. } => MessageKind::Shutdown,
            Self::Topic { .. } => MessageKind::Topic,
        }
    }
}

fn text(payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| Error::contract("pubsub payload is not valid UTF-8"))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// A receiver of cluster messages for one topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ClusterMessage);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&ClusterMessage) + Send + Sync,
{
    async fn handle(&self, message: &ClusterMessage) {
        self(message)
    }
}

/// Returned by [`PubSubDispatcher::subscribe`]; needed to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct HandlerTable {
    next_id: AtomicU64,
    by_topic: RwLock<HashMap<String, Vec<(HandlerId, Arc<dyn MessageHandler>)>>>,
}

impl HandlerTable {
    fn insert(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.by_topic
            .write()
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn remove(&self, topic: &str, id: HandlerId) -> bool {
        let mut table = self.by_topic.write();
        let Some(handlers) = table.get_mut(topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            table.remove(topic);
        }
        removed
    }

    /// Handlers are cloned out so none runs under the table lock.
    fn snapshot(&self, topic: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.by_topic
            .read()
            .get(topic)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Tasks {
    subscriber: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

pub struct PubSubDispatcher {
    backend: Arc<dyn Backend>,
    ns: Namespace,
    node_id: String,
    handlers: Arc<HandlerTable>,
    metrics: Arc<Metrics>,
    live: Arc<AtomicBool>,
    tasks: Mutex<Option<Tasks>>,
}

impl PubSubDispatcher {
    /// Subscribe to the namespace's channel pattern and start the loops.
    ///
    /// Waits for the subscription acknowledgement for at most
    /// `config.startup_timeout()`; past that, or when the subscription is
    /// refused, the result is [`Error::Startup`].
    pub async fn start(
        backend: Arc<dyn Backend>,
        ns: Namespace,
        node_id: impl Into<String>,
        config: &PubSubConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let node_id = node_id.into();
        let pattern = ns.pattern();
        let timeout = config.startup_timeout();
        let subscription = match tokio::time::timeout(timeout, backend.psubscribe(&pattern)).await
        {
            Ok(Ok(subscription)) => subscription,
            Ok(Err(e)) => {
                return Err(Error::Startup(format!("subscribe to {pattern} failed: {e}")));
            }
            Err(_) => {
                return Err(Error::Startup(format!(
                    "subscribe to {pattern} not acknowledged within {timeout:?}"
                )));
            }
        };

        let dispatcher = Self::new(backend, ns, node_id, metrics, true);
        let handlers = Arc::clone(&dispatcher.handlers);
        let workers_count = config.workers.max(1);
        let mut senders = Vec::with_capacity(workers_count);
        let mut workers = Vec::with_capacity(workers_count);
        for index in 0..workers_count {
            let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(index, rx, Arc::clone(&handlers))));
        }

        let subscriber = tokio::spawn(run_subscriber(SubscriberLoop {
            subscription,
            ns: dispatcher.ns.clone(),
            node_id: dispatcher.node_id.clone(),
            senders,
            metrics: Arc::clone(&dispatcher.metrics),
            live: Arc::clone(&dispatcher.live),
        }));
        *dispatcher.tasks.lock() = Some(Tasks {
            subscriber,
            workers,
        });

        info!(%pattern, node_id = %dispatcher.node_id, workers = workers_count, "pubsub dispatcher started");
        Ok(dispatcher)
    }

    /// A dispatcher without a subscription.  It can publish; registered
    /// handlers are never called.
    pub fn degraded(
        backend: Arc<dyn Backend>,
        ns: Namespace,
        node_id: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::new(backend, ns, node_id.into(), metrics, false)
    }

    fn new(
        backend: Arc<dyn Backend>,
        ns: Namespace,
        node_id: String,
        metrics: Arc<Metrics>,
        live: bool,
    ) -> Self {
        Self {
            backend,
            ns,
            node_id,
            handlers: Arc::new(HandlerTable::default()),
            metrics,
            live: Arc::new(AtomicBool::new(live)),
            tasks: Mutex::new(None),
        }
    }

    /// `true` while the subscriber loop is running.
    pub fn is_subscribed(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let id = self.handlers.insert(topic, handler);
        debug!(%topic, ?id, "handler registered");
        id
    }

    pub fn unsubscribe(&self, topic: &str, id: HandlerId) -> bool {
        self.handlers.remove(topic, id)
    }

    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.backend.publish(&self.ns.channel(topic), payload).await
    }

    /// Stop the subscriber loop and the workers.
    ///
    /// The sentinel unblocks this node's subscriber loop; if it does not
    /// come back within a grace period the loop is aborted.  Workers finish
    /// the messages already queued to them.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };
        let Tasks {
            mut subscriber,
            workers,
        } = tasks;

        let sentinel = Bytes::from(self.node_id.clone());
        if let Err(e) = self.publish(SHUTDOWN_TOPIC, sentinel).await {
            warn!(error = %e, "failed to publish shutdown sentinel");
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut subscriber)
            .await
            .is_err()
        {
            warn!("subscriber loop did not stop in time, aborting");
            subscriber.abort();
            let _ = subscriber.await;
        }
        self.live.store(false, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for mut worker in workers {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                warn!("pubsub worker did not stop in time, aborting");
                worker.abort();
                let _ = worker.await;
            }
        }
        info!(node_id = %self.node_id, "pubsub dispatcher stopped");
    }
}

struct SubscriberLoop {
    subscription: Subscription,
    ns: Namespace,
    node_id: String,
    senders: Vec<mpsc::Sender<ClusterMessage>>,
    metrics: Arc<Metrics>,
    live: Arc<AtomicBool>,
}

async fn run_subscriber(mut state: SubscriberLoop) {
    while let Some(ChannelMessage { channel, payload }) = state.subscription.recv().await {
        let Some(topic) = state.ns.topic_of(&channel) else {
            continue;
        };
        let message = match ClusterMessage::decode(topic, payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(%channel, error = %e, "dropping undecodable message");
                continue;
            }
        };
        state
            .metrics
            .pubsub_messages
            .get_or_create(&MessageLabels {
                kind: message.kind(),
            })
            .inc();

        if let ClusterMessage::Shutdown { origin } = &message {
            if *origin == state.node_id {
                debug!("shutdown sentinel received");
                break;
            }
        }

        let index = worker_index(topic, state.senders.len());
        let kind = message.kind();
        match state.senders[index].try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                state
                    .metrics
                    .pubsub_dropped
                    .get_or_create(&MessageLabels { kind })
                    .inc();
                warn!(worker = index, %topic, "pubsub worker queue full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(worker = index, %topic, "pubsub worker is gone, message dropped");
            }
        }
    }
    state.live.store(false, Ordering::SeqCst);
    // Dropping the senders lets the workers drain and exit.
    drop(state.senders);
    state.subscription.close().await;
}

async fn run_worker(
    index: usize,
    mut rx: mpsc::Receiver<ClusterMessage>,
    handlers: Arc<HandlerTable>,
) {
    while let Some(message) = rx.recv().await {
        let topic = message.topic();
        let targets = handlers.snapshot(&topic);
        trace!(worker = index, %topic, handlers = targets.len(), "delivering message");
        for handler in targets {
            handler.handle(&message).await;
        }
    }
    debug!(worker = index, "pubsub worker stopped");
}

fn worker_index(topic: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::store::memory::MemoryBackend;

    fn config() -> PubSubConfig {
        PubSubConfig {
            workers: 2,
            startup_timeout_ms: 200,
            channel_capacity: 16,
        }
    }

    #[test]
    fn decodes_each_kind() {
        let inval = ClusterMessage::decode("inval:docs", Bytes::from_static(b"n1:a,b")).unwrap();
        assert_eq!(
            inval,
            ClusterMessage::Invalidation {
                scope: "docs".into(),
                origin: "n1".into(),
                body: Bytes::from_static(b"a,b"),
            }
        );
        assert_eq!(inval.topic(), "inval:docs");

        let lock = ClusterMessage::decode("lock:doc-1", Bytes::from_static(b"owner")).unwrap();
        assert_eq!(lock.kind(), MessageKind::LockReleased);
        assert_eq!(lock.topic(), "lock:doc-1");

        let stop = ClusterMessage::decode(SHUTDOWN_TOPIC, Bytes::from_static(b"n2")).unwrap();
        assert_eq!(stop, ClusterMessage::Shutdown { origin: "n2".into() });

        let other = ClusterMessage::decode("jobs", Bytes::from_static(b"x")).unwrap();
        assert_eq!(other.kind(), MessageKind::Topic);
    }

    #[test]
    fn invalidation_without_origin_is_rejected() {
        assert!(ClusterMessage::decode("inval:docs", Bytes::from_static(b"noorigin")).is_err());
    }

    #[test]
    fn routing_is_stable_per_topic() {
        assert_eq!(worker_index("a", 4), worker_index("a", 4));
        assert!(worker_index("b", 3) < 3);
    }

    #[tokio::test]
    async fn delivers_to_topic_handlers() {
        let store = MemoryBackend::new();
        let dispatcher = PubSubDispatcher::start(
            Arc::new(store.clone()),
            Namespace::new("t:"),
            "n1",
            &config(),
            MetricsRegistry::new().metrics,
        )
        .await
        .unwrap();
        assert!(dispatcher.is_subscribed());

        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(
            "jobs",
            Arc::new(move |m: &ClusterMessage| {
                let _ = tx.send(m.clone());
            }),
        );
        for i in 0..5u8 {
            dispatcher.publish("jobs", Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..5u8 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(
                msg,
                ClusterMessage::Topic {
                    topic: "jobs".into(),
                    payload: Bytes::from(vec![i]),
                }
            );
        }

        dispatcher.shutdown().await;
        assert!(!dispatcher.is_subscribed());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_handler_does_not_block_other_topics() {
        let store = MemoryBackend::new();
        let registry = MetricsRegistry::new();
        let dispatcher = PubSubDispatcher::start(
            Arc::new(store.clone()),
            Namespace::new("t:"),
            "n1",
            &PubSubConfig {
                workers: 2,
                startup_timeout_ms: 200,
                channel_capacity: 1,
            },
            Arc::clone(&registry.metrics),
        )
        .await
        .unwrap();

        struct Stuck;
        #[async_trait]
        impl MessageHandler for Stuck {
            async fn handle(&self, _: &ClusterMessage) {
                std::future::pending::<()>().await;
            }
        }
        let slow = "slow";
        let fast = (0..64)
            .map(|i| format!("fast-{i}"))
            .find(|t| worker_index(t, 2) != worker_index(slow, 2))
            .unwrap();

        dispatcher.subscribe(slow, Arc::new(Stuck));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(
            &fast,
            Arc::new(move |m: &ClusterMessage| {
                let _ = tx.send(m.clone());
            }),
        );

        for _ in 0..4 {
            dispatcher.publish(slow, Bytes::from_static(b"x")).await.unwrap();
        }
        dispatcher.publish(&fast, Bytes::from_static(b"y")).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.topic(), fast);
        let dropped = registry
            .metrics
            .pubsub_dropped
            .get_or_create(&MessageLabels {
                kind: MessageKind::Topic,
            })
            .get();
        assert!(dropped >= 1);

        let started = tokio::time::Instant::now();
        dispatcher.shutdown().await;
        assert!(started.elapsed() <= SHUTDOWN_GRACE + Duration::from_secs(1));
        assert!(!dispatcher.is_subscribed());
    }

    #[tokio::test]
    async fn unsubscribed_handlers_stop_receiving() {
        let store = MemoryBackend::new();
        let dispatcher = PubSubDispatcher::start(
            Arc::new(store.clone()),
            Namespace::new("t:"),
            "n1",
            &config(),
            MetricsRegistry::new().metrics,
        )
        .await
        .unwrap();
        let id = dispatcher.subscribe("jobs", Arc::new(|_: &ClusterMessage| {}));
        assert!(dispatcher.unsubscribe("jobs", id));
        assert!(!dispatcher.unsubscribe("jobs", id));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn startup_times_out_without_acknowledgement() {
        let store = MemoryBackend::new();
        store.stall_subscriptions(true);
        let result = PubSubDispatcher::start(
            Arc::new(store.clone()),
            Namespace::new("t:"),
            "n1",
            &config(),
            MetricsRegistry::new().metrics,
        )
        .await;
        assert!(matches!(result, Err(Error::Startup(_))));
    }

    #[tokio::test]
    async fn degraded_dispatcher_can_publish() {
        let store = MemoryBackend::new();
        let mut sub = store.psubscribe("t:pubsub:*").await.unwrap();
        let dispatcher = PubSubDispatcher::degraded(
            Arc::new(store.clone()),
            Namespace::new("t:"),
            "n1",
            MetricsRegistry::new().metrics,
        );
        assert!(!dispatcher.is_subscribed());
        dispatcher
            .publish("jobs", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().channel, "t:pubsub:jobs");
        dispatcher.shutdown().await;
    }
}
