//! Coordination store client.
//!
//! [`Backend`] is the thin execution façade every component talks to: plain
//! commands, atomic [`Script`]s and pattern subscriptions.  Two backends are
//! provided:
//!
//! - [`redis::RedisBackend`], a `fred` pool against Redis / KeyDB.  Scripts
//!   are pre-loaded and run by digest.
//! - [`memory::MemoryBackend`], an in-process store used by tests and
//!   single-node deployments.  Cloned handles share one dataset, which is
//!   how several nodes are simulated against one store.

pub mod memory;
pub mod redis;
mod script;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

pub use script::{arg, arg_i64, arg_str, key, LocalScript, Reply, Script};

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// An acknowledged pattern subscription.
///
/// The dedicated connection behind it is released once the subscription is
/// dropped or [`Subscription::close`]d.
pub struct Subscription {
    messages: mpsc::Receiver<ChannelMessage>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(messages: mpsc::Receiver<ChannelMessage>, forwarder: JoinHandle<()>) -> Self {
        Self {
            messages,
            forwarder,
        }
    }

    /// Next message, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.messages.recv().await
    }

    /// Drop the receiving side and wait for the connection to be released.
    pub async fn close(self) {
        let Self {
            messages,
            forwarder,
        } = self;
        drop(messages);
        let _ = forwarder.await;
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>>;

    /// `SET`, with an expiry in seconds when `ttl` is given.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<u64>) -> Result<()>;

    async fn del(&self, keys: &[String]) -> Result<u64>;

    async fn exists(&self, keys: &[String]) -> Result<u64>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool>;

    async fn persist(&self, key: &str) -> Result<bool>;

    /// Atomic increment.  Fails with [`crate::Error::Contract`] when the
    /// stored value is not an integer.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>>;

    /// `true` when `field` is new.
    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<bool>;

    async fn hdel(&self, key: &str, field: &str) -> Result<u64>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Bytes>>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Every live key matching the glob `pattern`, as of the call.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Run an atomic script.  All keys it touches are listed in `keys`.
    async fn eval(&self, script: &'static Script, keys: Vec<String>, args: Vec<Bytes>)
        -> Result<Reply>;

    /// Subscribe to a channel pattern on a dedicated connection.  Resolves
    /// once the store has acknowledged the subscription.
    async fn psubscribe(&self, pattern: &str) -> Result<Subscription>;
}

/// Build the backend selected by `config`.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn Backend>> {
    match config.backend {
        StoreBackend::Redis => Ok(Arc::new(redis::RedisBackend::connect(config).await?)),
        StoreBackend::Memory => {
            tracing::info!("using in-process memory store");
            Ok(Arc::new(memory::MemoryBackend::new()))
        }
    }
}
