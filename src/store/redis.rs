//! Redis / KeyDB backend over a `fred` connection pool.
//!
//! Request/response commands share the pool.  Each subscription gets its own
//! [`SubscriberClient`], because a connection in subscribe mode cannot run
//! other commands; it is never returned to the pool and is quit when the
//! subscription ends.  Scripts are loaded once with `SCRIPT LOAD` and invoked
//! by digest; a `NOSCRIPT` reply (e.g. after a server restart or failover)
//! reloads the script and retries once.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fred::clients::{Pool, SubscriberClient};
use fred::interfaces::{
    ClientLike, EventInterface, HashesInterface, KeysInterface, ListInterface, LuaInterface,
    PubsubInterface, SetsInterface,
};
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, CustomCommand, Expiration, Value};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Backend, ChannelMessage, Reply, Script, Subscription};
use crate::config::StoreConfig;
use crate::error::{Error, Result};

const SUBSCRIPTION_BUFFER: usize = 1024;

pub struct RedisBackend {
    pool: Pool,
    /// Script name -> SHA1 digest returned by `SCRIPT LOAD`.
    digests: RwLock<HashMap<&'static str, String>>,
}

impl RedisBackend {
    /// Build and initialise the pool, then verify it with a PING.
    ///
    /// The auth token is read from the environment variable named by
    /// `config.auth_token_env`.  With `config.tls` the connection uses
    /// `rustls` through fred's built-in support.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let auth_token = std::env::var(&config.auth_token_env).ok();

        // The endpoint may carry a `redis://` or `rediss://` scheme.
        let endpoint = config
            .endpoint
            .trim_start_matches("rediss://")
            .trim_start_matches("redis://");
        let (host, port) = parse_host_port(endpoint)?;

        let mut fred_config = FredConfig {
            server: ServerConfig::new_centralized(host, port),
            ..FredConfig::default()
        };
        if config.tls {
            fred_config.tls = Some(
                TlsConnector::default_rustls()
                    .map_err(Error::from)?
                    .into(),
            );
        }
        if let Some(token) = auth_token {
            fred_config.password = Some(token);
        }

        let mut builder = Builder::from_config(fred_config);
        // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));
        builder.with_connection_config(|conn| {
            conn.connection_timeout = Duration::from_millis(config.connect_timeout_ms);
            conn.max_command_attempts = config.max_command_attempts;
        });

        let pool = builder.build_pool(config.pool_size)?;
        pool.init().await?;
        let _: String = pool.ping(None).await?;

        info!(
            host,
            port,
            tls = config.tls,
            pool_size = config.pool_size,
            "store pool created and verified"
        );

        Ok(Self {
            pool,
            digests: RwLock::new(HashMap::new()),
        })
    }

    async fn load_script(&self, script: &'static Script) -> Result<String> {
        let digest: String = self.pool.script_load(script.lua).await?;
        debug!(script = script.name, %digest, "script loaded");
        self.digests.write().insert(script.name, digest.clone());
        Ok(digest)
    }

    async fn digest(&self, script: &'static Script) -> Result<String> {
        let cached = self.digests.read().get(script.name).cloned();
        match cached {
            Some(digest) => Ok(digest),
            None => self.load_script(script).await,
        }
    }

    async fn evalsha(&self, digest: String, keys: Vec<String>, args: Vec<Value>) -> Result<Value> {
        Ok(self.pool.evalsha(digest, keys, args).await?)
    }
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. from URIs).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .map_err(|_| Error::Backend(format!("invalid port in endpoint: {endpoint}")))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

fn value_bytes(value: Value) -> Result<Option<Bytes>> {
    match value {
        Value::Null => Ok(None),
        Value::Bytes(b) => Ok(Some(b)),
        Value::String(s) => Ok(Some(s.into_inner())),
        Value::Integer(n) => Ok(Some(Bytes::from(n.to_string()))),
        Value::Double(f) => Ok(Some(Bytes::from(f.to_string()))),
        Value::Boolean(b) => Ok(Some(Bytes::from(if b { "1" } else { "0" }))),
        other => Err(Error::Backend(format!("unexpected bulk reply: {other:?}"))),
    }
}

fn into_reply(value: Value) -> Result<Reply> {
    match value {
        Value::Null => Ok(Reply::Nil),
        Value::Integer(n) => Ok(Reply::Int(n)),
        Value::Boolean(b) => Ok(Reply::Int(i64::from(b))),
        Value::Array(items) => items
            .into_iter()
            .map(into_reply)
            .collect::<Result<Vec<_>>>()
            .map(Reply::Array),
        other => value_bytes(other).map(|b| b.map_or(Reply::Nil, Reply::Data)),
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn ping(&self) -> Result<()> {
        let _: String = self.pool.ping(None).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let value: Value = self.pool.get(key).await?;
        value_bytes(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Value> = self.pool.mget(keys.to_vec()).await?;
        values.into_iter().map(value_bytes).collect()
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<u64>) -> Result<()> {
        let _: () = self
            .pool
            .set(
                key,
                Value::Bytes(value),
                ttl.map(|t| Expiration::EX(t as i64)),
                None,
                false,
            )
            .await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = self.pool.del(keys.to_vec()).await?;
        Ok(removed)
    }

    async fn exists(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let found: u64 = self.pool.exists(keys.to_vec()).await?;
        Ok(found)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let applied: bool = self.pool.expire(key, ttl_secs as i64, None).await?;
        Ok(applied)
    }

    async fn persist(&self, key: &str) -> Result<bool> {
        let cleared: bool = self.pool.persist(key).await?;
        Ok(cleared)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let value: i64 = self.pool.incr_by(key, delta).await?;
        Ok(value)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>> {
        let value: Value = self.pool.hget(key, field).await?;
        value_bytes(value)
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<bool> {
        let added: u64 = self.pool.hset(key, (field, Value::Bytes(value))).await?;
        Ok(added > 0)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<u64> {
        let removed: u64 = self.pool.hdel(key, field).await?;
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Bytes>> {
        let map: HashMap<String, Vec<u8>> = self.pool.hgetall(key).await?;
        Ok(map.into_iter().map(|(k, v)| (k, Bytes::from(v))).collect())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        let items: Vec<Vec<u8>> = self.pool.lrange(key, start, stop).await?;
        Ok(items.into_iter().map(Bytes::from).collect())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let members: Vec<String> = self.pool.smembers(key).await?;
        Ok(members)
    }

    /// Uses `KEYS`, which is acceptable for the small per-namespace key
    /// spaces enumerated here.  Very large deployments should replace it
    /// with an incremental `SCAN`.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = self
            .pool
            .custom(
                CustomCommand::new_static("KEYS", None::<u16>, false),
                vec![pattern.to_string()],
            )
            .await?;
        Ok(keys)
    }

    /// `Pool` does not implement `PubsubInterface`, so publish through one
    /// of its clients.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let _: i64 = self
            .pool
            .next()
            .publish(channel, Value::Bytes(payload))
            .await?;
        Ok(())
    }

    async fn eval(
        &self,
        script: &'static Script,
        keys: Vec<String>,
        args: Vec<Bytes>,
    ) -> Result<Reply> {
        let args: Vec<Value> = args.into_iter().map(Value::Bytes).collect();
        let digest = self.digest(script).await?;
        let value = match self.evalsha(digest, keys.clone(), args.clone()).await {
            Err(Error::Backend(detail)) if detail.contains("NOSCRIPT") => {
                warn!(script = script.name, "script missing on server, reloading");
                let digest = self.load_script(script).await?;
                self.evalsha(digest, keys, args).await?
            }
            other => other?,
        };
        into_reply(value)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription> {
        let client = self.pool.next();
        let subscriber = SubscriberClient::new(
            client.client_config(),
            None,
            None,
            client.client_reconnect_policy(),
        );
        let _connection = subscriber.connect();
        subscriber.wait_for_connect().await?;
        // Re-issue subscriptions after a reconnect.
        let _resubscribe = subscriber.manage_subscriptions();

        // Take the message stream before subscribing so nothing is missed
        // between the acknowledgement and the first receive.
        let mut message_rx = subscriber.message_rx();
        subscriber.psubscribe(pattern).await?;
        info!(%pattern, "pattern subscription acknowledged");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pattern = pattern.to_owned();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    received = message_rx.recv() => match received {
                        Ok(message) => {
                            let payload = match value_bytes(message.value) {
                                Ok(Some(payload)) => payload,
                                Ok(None) => Bytes::new(),
                                Err(e) => {
                                    warn!(error = %e, "dropping undecodable pubsub payload");
                                    continue;
                                }
                            };
                            let message = ChannelMessage {
                                channel: message.channel.to_string(),
                                payload,
                            };
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%pattern, skipped, "subscriber lagged, messages dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            let _ = subscriber.punsubscribe(pattern.as_str()).await;
            let _ = subscriber.quit().await;
            debug!(%pattern, "subscriber connection released");
        });

        Ok(Subscription::new(rx, forwarder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_port() {
        let (host, port) = parse_host_port("keydb.local:6380").unwrap();
        assert_eq!(host, "keydb.local");
        assert_eq!(port, 6380);
    }

    #[test]
    fn test_parse_host_port_default() {
        let (host, port) = parse_host_port("keydb.local").unwrap();
        assert_eq!(host, "keydb.local");
        assert_eq!(port, 6379);
    }

    #[test]
    fn test_parse_host_port_invalid() {
        assert!(parse_host_port("keydb.local:notaport").is_err());
    }

    #[test]
    fn script_replies_convert() {
        let value = Value::Array(vec![
            Value::Integer(3),
            Value::Null,
            Value::Bytes(Bytes::from_static(b"x")),
        ]);
        assert_eq!(
            into_reply(value).unwrap(),
            Reply::Array(vec![Reply::Int(3), Reply::Nil, Reply::data("x")])
        );
    }
}
