//! One handle per process that owns every coordination component.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::invalidation::{InvalidationPropagator, Invalidations};
use crate::kv::KeyValueStore;
use crate::lock::LockManager;
use crate::metrics::MetricsRegistry;
use crate::namespace::Namespace;
use crate::node;
use crate::pubsub::{HandlerId, MessageHandler, PubSubDispatcher};
use crate::store::{self, Backend};
use crate::transient::TransientStore;
use crate::work::{QueueConfig, WorkItem, WorkQueue, WorkQueues};

pub struct Coordinator {
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
    ns: Namespace,
    node_id: String,
    metrics: MetricsRegistry,
    kv: KeyValueStore,
    locks: LockManager,
    pubsub: Arc<PubSubDispatcher>,
    work: WorkQueues,
    invalidation: HashMap<String, InvalidationPropagator>,
    transient: HashMap<String, TransientStore>,
}

impl Coordinator {
    /// Connect to the configured store and bring every component up.
    pub async fn start(config: Config) -> Result<Self> {
        let backend = store::connect(&config.store).await?;
        Self::with_backend(config, backend).await
    }

    /// Bring every component up on an existing backend.
    ///
    /// A dispatcher that cannot subscribe is replaced by a degraded one:
    /// this node still publishes but receives nothing until restarted.
    pub async fn with_backend(config: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        config::validate_config(&config).map_err(|e| Error::Startup(format!("{e:#}")))?;

        let ns = Namespace::new(config.namespace.clone());
        let node_id = match &config.node.id {
            Some(id) => id.clone(),
            None => node::node_id().map_err(|e| Error::Startup(e.to_string()))?,
        };
        let metrics = MetricsRegistry::new();
        let shared = Arc::clone(&metrics.metrics);
        info!(%node_id, namespace = %ns.prefix(), "starting coordinator");

        let work = WorkQueues::new(Arc::clone(&backend), ns.clone(), Arc::clone(&shared));
        for name in &config.work.queues {
            work.init(QueueConfig::new(name.clone(), &config.work))?;
        }

        let pubsub = match PubSubDispatcher::start(
            Arc::clone(&backend),
            ns.clone(),
            node_id.clone(),
            &config.pubsub,
            Arc::clone(&shared),
        )
        .await
        {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                warn!(error = %e, "pubsub unavailable, continuing without subscription");
                PubSubDispatcher::degraded(
                    Arc::clone(&backend),
                    ns.clone(),
                    node_id.clone(),
                    Arc::clone(&shared),
                )
            }
        };
        let pubsub = Arc::new(pubsub);

        let mut invalidation = HashMap::with_capacity(config.invalidation.scopes.len());
        for scope in &config.invalidation.scopes {
            match InvalidationPropagator::initialize(
                Arc::clone(&backend),
                Arc::clone(&pubsub),
                ns.clone(),
                &node_id,
                scope,
                &config.invalidation,
                Arc::clone(&shared),
            )
            .await
            {
                Ok(propagator) => {
                    invalidation.insert(scope.clone(), propagator);
                }
                Err(e) => {
                    warn!(%scope, error = %e, "invalidation scope failed to open, stopping");
                    close_all(&invalidation, &pubsub).await;
                    return Err(e);
                }
            }
        }

        let transient = config
            .transient
            .iter()
            .map(|(name, store_config)| {
                let store = TransientStore::new(
                    name.clone(),
                    store_config.clone(),
                    Arc::clone(&backend),
                    &ns,
                    Arc::clone(&shared),
                );
                (name.clone(), store)
            })
            .collect();

        let coordinator = Self {
            kv: KeyValueStore::new(Arc::clone(&backend), ns.clone(), Arc::clone(&shared)),
            locks: LockManager::new(Arc::clone(&backend), ns.clone(), Arc::clone(&shared)),
            config: Arc::new(config),
            backend,
            ns,
            node_id,
            metrics,
            pubsub,
            work,
            invalidation,
            transient,
        };
        info!(
            node_id = %coordinator.node_id,
            subscribed = coordinator.pubsub.is_subscribed(),
            queues = coordinator.work.names().len(),
            scopes = coordinator.invalidation.len(),
            transient_stores = coordinator.transient.len(),
            "coordinator ready"
        );
        Ok(coordinator)
    }

    // -- handles --------------------------------------------------------------

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn kv(&self) -> &KeyValueStore {
        &self.kv
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn pubsub(&self) -> &Arc<PubSubDispatcher> {
        &self.pubsub
    }

    pub fn work(&self) -> &WorkQueues {
        &self.work
    }

    /// The named queue, opened with the process-wide polling settings if
    /// this node has not used it yet.
    pub fn queue(&self, name: &str) -> Result<Arc<WorkQueue>> {
        match self.work.get(name) {
            Some(queue) => Ok(queue),
            None => self.work.init(QueueConfig::new(name, &self.config.work)),
        }
    }

    pub fn invalidation(&self, scope: &str) -> Option<&InvalidationPropagator> {
        self.invalidation.get(scope)
    }

    pub fn transient(&self, name: &str) -> Option<&TransientStore> {
        self.transient.get(name)
    }

    // -- entry points ---------------------------------------------------------

    /// Schedule `payload` as work `id` on `queue`.  `false` when that id is
    /// already scheduled or running.
    pub async fn schedule_work(&self, queue: &str, id: &str, payload: Bytes) -> Result<bool> {
        let queue = self.queue(queue)?;
        queue
            .schedule(&WorkItem::new(queue.name(), id, payload))
            .await
    }

    /// Take `resource` for `owner`.  Re-acquiring with the same owner token
    /// succeeds; any other token is refused while the lock is held.
    pub async fn acquire_lock(&self, resource: &str, owner: &str) -> Result<bool> {
        self.locks.acquire(resource, owner).await
    }

    pub async fn release_lock(&self, resource: &str, owner: &str) -> Result<bool> {
        self.locks.release(resource, owner).await
    }

    /// Announce `batch` to the other nodes of `scope`.  Only scopes listed
    /// in the configuration are open.
    pub async fn invalidate(&self, scope: &str, batch: &Invalidations) -> Result<()> {
        let propagator = self
            .invalidation
            .get(scope)
            .ok_or_else(|| Error::contract(format!("invalidation scope {scope:?} is not configured")))?;
        propagator.send_invalidations(batch).await
    }

    pub async fn kv_get(&self, key: &str) -> Result<Option<Bytes>> {
        self.kv.get(key).await
    }

    pub async fn kv_put(&self, key: &str, value: Option<Bytes>, ttl: u64) -> Result<()> {
        self.kv.put(key, value, ttl).await
    }

    pub async fn kv_compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
        ttl: u64,
    ) -> Result<bool> {
        self.kv.compare_and_set(key, expected, new, ttl).await
    }

    pub fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> HandlerId {
        self.pubsub.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, topic: &str, id: HandlerId) -> bool {
        self.pubsub.unsubscribe(topic, id)
    }

    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.pubsub.publish(topic, payload).await
    }

    /// Deregister from every scope, then stop the dispatcher.
    pub async fn shutdown(&self) {
        close_all(&self.invalidation, &self.pubsub).await;
        info!(node_id = %self.node_id, "coordinator shut down");
    }
}

async fn close_all(
    invalidation: &HashMap<String, InvalidationPropagator>,
    pubsub: &PubSubDispatcher,
) {
    for (scope, propagator) in invalidation {
        if let Err(e) = propagator.close().await {
            warn!(%scope, error = %e, "failed to close invalidation propagator");
        }
    }
    pubsub.shutdown().await;
}
