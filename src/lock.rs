//! Distributed lock manager.
//!
//! A lock is one string key `<ns>lock:<resource>` holding
//! `<owner>:<creationEpochMillis>`, so owner and timestamp change together.
//! There is no wait loop here: callers that need blocking acquisition poll
//! [`LockManager::set_lock`] or listen for the `lock:<resource>` release
//! topic on the dispatcher.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::namespace::{Namespace, Subsystem};
use crate::store::memory::Db;
use crate::store::{arg, arg_str, key, Backend, Reply, Script};

/// Topic on which the release of `resource` is announced.
pub fn release_topic(resource: &str) -> String {
    format!("lock:{resource}")
}

// ---------------------------------------------------------------------------
// Lock value
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub owner: String,
    pub created: DateTime<Utc>,
    /// Set on the value returned by a removal that was refused because
    /// `owner` holds the lock.
    pub failed: bool,
}

impl Lock {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            created: Utc::now(),
            failed: false,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.owner, self.created.timestamp_millis())
    }

    /// Parse `<owner>:<epochMillis>`.  The owner may itself contain `:`, so
    /// the value is split at the last delimiter.
    pub fn parse(value: &str) -> Result<Self> {
        let (owner, millis) = value
            .rsplit_once(':')
            .ok_or_else(|| Error::contract(format!("lock value without delimiter: {value:?}")))?;
        let created = millis
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| Error::contract(format!("lock value with bad timestamp: {value:?}")))?;
        Ok(Self {
            owner: owner.to_string(),
            created,
            failed: false,
        })
    }

    fn from_bytes(value: &[u8]) -> Result<Self> {
        let value = std::str::from_utf8(value)
            .map_err(|_| Error::contract("lock value is not valid UTF-8"))?;
        Self::parse(value)
    }
}

fn owner_of(value: &[u8]) -> Option<&[u8]> {
    let split = value.iter().rposition(|b| *b == b':')?;
    Some(&value[..split])
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// KEYS: lock.  ARGV: value.  Returns the current holder, or nil when the
/// lock was installed by this call.
static SET_LOCK: Script = Script {
    name: "lock_set",
    lua: r#"
        local current = redis.call('GET', KEYS[1])
        if current then
            return current
        end
        redis.call('SET', KEYS[1], ARGV[1])
        return false
    "#,
    local: set_lock_local,
};

fn set_lock_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let k = key(keys, 0)?;
    if let Some(current) = db.get(k)? {
        return Ok(Reply::Data(current));
    }
    db.set(k, arg(args, 0)?.clone(), None);
    Ok(Reply::Nil)
}

/// KEYS: lock.  ARGV: force ("1"/"0"), owner, release channel.
///
/// Returns nil when there is no lock, `{1, value}` when it was removed and
/// `{0, value}` when another owner holds it.
static REMOVE_LOCK: Script = Script {
    name: "lock_remove",
    lua: r#"
        local current = redis.call('GET', KEYS[1])
        if not current then
            return false
        end
        if ARGV[1] ~= '1' then
            local holder = string.match(current, '^(.*):[^:]*$')
            if holder ~= ARGV[2] then
                return {0, current}
            end
        end
        redis.call('DEL', KEYS[1])
        local owner = string.match(current, '^(.*):[^:]*$') or current
        redis.call('PUBLISH', ARGV[3], owner)
        return {1, current}
    "#,
    local: remove_lock_local,
};

fn remove_lock_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let k = key(keys, 0)?;
    let Some(current) = db.get(k)? else {
        return Ok(Reply::Nil);
    };
    let force = arg(args, 0)?.as_ref() == b"1";
    let holder = owner_of(&current);
    if !force && holder != Some(arg(args, 1)?.as_ref()) {
        return Ok(Reply::Array(vec![Reply::Int(0), Reply::Data(current)]));
    }
    db.del(k);
    let owner = Bytes::copy_from_slice(holder.unwrap_or(&current));
    db.publish(arg_str(args, 2)?, owner);
    Ok(Reply::Array(vec![Reply::Int(1), Reply::Data(current)]))
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct LockManager {
    backend: Arc<dyn Backend>,
    ns: Namespace,
    metrics: Arc<Metrics>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn Backend>, ns: Namespace, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            ns,
            metrics,
        }
    }

    pub async fn get_lock(&self, resource: &str) -> Result<Option<Lock>> {
        self.backend
            .get(&self.ns.key(Subsystem::Lock, resource))
            .await?
            .map(|v| Lock::from_bytes(&v))
            .transpose()
    }

    /// Install `lock` unless the resource is already locked.
    ///
    /// Returns the existing holder unchanged when there is one, `None` when
    /// this call took the lock.
    pub async fn set_lock(&self, resource: &str, lock: &Lock) -> Result<Option<Lock>> {
        let reply = self
            .backend
            .eval(
                &SET_LOCK,
                vec![self.ns.key(Subsystem::Lock, resource)],
                vec![Bytes::from(lock.encode())],
            )
            .await?;
        let existing = reply
            .into_bytes()?
            .map(|v| Lock::from_bytes(&v))
            .transpose()?;
        debug!(%resource, owner = %lock.owner, acquired = existing.is_none(), "set_lock");
        Ok(existing)
    }

    /// Remove the lock on `resource`.
    ///
    /// With `owner` set, the lock is only removed when `owner` holds it;
    /// otherwise the real holder is returned with `failed` set.  Without an
    /// owner the removal is forced.  A successful removal announces itself on
    /// [`release_topic`].
    pub async fn remove_lock(&self, resource: &str, owner: Option<&str>) -> Result<Option<Lock>> {
        let (force, owner_arg) = match owner {
            Some(o) => ("0", o),
            None => ("1", ""),
        };
        let reply = self
            .backend
            .eval(
                &REMOVE_LOCK,
                vec![self.ns.key(Subsystem::Lock, resource)],
                vec![
                    Bytes::from_static(force.as_bytes()),
                    Bytes::copy_from_slice(owner_arg.as_bytes()),
                    Bytes::from(self.ns.channel(&release_topic(resource))),
                ],
            )
            .await?;
        if reply.is_nil() {
            debug!(%resource, "remove_lock: no lock");
            return Ok(None);
        }
        let mut parts = reply.into_array()?.into_iter();
        let removed = parts
            .next()
            .ok_or_else(|| Error::contract("remove_lock reply is empty"))?
            .into_int()?
            == 1;
        let value = parts
            .next()
            .and_then(|p| p.into_bytes().transpose())
            .transpose()?
            .ok_or_else(|| Error::contract("remove_lock reply has no value"))?;
        let mut lock = Lock::from_bytes(&value)?;
        lock.failed = !removed;
        debug!(%resource, holder = %lock.owner, removed, "remove_lock");
        Ok(Some(lock))
    }

    /// Take the lock for `owner`.  `true` when this call installed it or
    /// `owner` already held it.
    pub async fn acquire(&self, resource: &str, owner: &str) -> Result<bool> {
        match self.set_lock(resource, &Lock::new(owner)).await? {
            None => {
                self.metrics.lock_acquisitions.inc();
                Ok(true)
            }
            Some(holder) if holder.owner == owner => Ok(true),
            Some(holder) => {
                self.metrics.lock_contentions.inc();
                debug!(%resource, %owner, holder = %holder.owner, "lock held elsewhere");
                Ok(false)
            }
        }
    }

    /// Release the lock held by `owner`.  `false` when there was no lock or
    /// another owner holds it.
    pub async fn release(&self, resource: &str, owner: &str) -> Result<bool> {
        match self.remove_lock(resource, Some(owner)).await? {
            Some(lock) if !lock.failed => Ok(true),
            Some(lock) => {
                self.metrics.lock_release_failures.inc();
                warn!(%resource, %owner, holder = %lock.owner, "lock release refused, held by another owner");
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::store::memory::MemoryBackend;

    fn manager(backend: &MemoryBackend) -> LockManager {
        LockManager::new(
            Arc::new(backend.clone()),
            Namespace::new("t:"),
            MetricsRegistry::new().metrics,
        )
    }

    #[test]
    fn parse_splits_at_last_delimiter() {
        let lock = Lock::parse("proc:42:1700000000123").unwrap();
        assert_eq!(lock.owner, "proc:42");
        assert_eq!(lock.created.timestamp_millis(), 1_700_000_000_123);
        assert!(!lock.failed);
    }

    #[test]
    fn malformed_values_are_contract_violations() {
        assert!(matches!(Lock::parse("nodelimiter"), Err(Error::Contract(_))));
        assert!(matches!(Lock::parse("owner:abc"), Err(Error::Contract(_))));
    }

    #[test]
    fn encode_round_trips() {
        let lock = Lock::new("session-9");
        let parsed = Lock::parse(&lock.encode()).unwrap();
        assert_eq!(parsed.owner, "session-9");
        assert_eq!(
            parsed.created.timestamp_millis(),
            lock.created.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn set_lock_keeps_existing_holder() {
        let store = MemoryBackend::new();
        let locks = manager(&store);
        let first = Lock::new("a");
        assert_eq!(locks.set_lock("doc", &first).await.unwrap(), None);
        let existing = locks.set_lock("doc", &Lock::new("b")).await.unwrap().unwrap();
        assert_eq!(existing.owner, "a");
        assert_eq!(locks.get_lock("doc").await.unwrap().unwrap().owner, "a");
    }

    #[tokio::test]
    async fn remove_with_wrong_owner_reports_holder() {
        let store = MemoryBackend::new();
        let locks = manager(&store);
        locks.set_lock("doc", &Lock::new("a")).await.unwrap();

        let refused = locks.remove_lock("doc", Some("b")).await.unwrap().unwrap();
        assert!(refused.failed);
        assert_eq!(refused.owner, "a");
        assert!(locks.get_lock("doc").await.unwrap().is_some());

        let removed = locks.remove_lock("doc", Some("a")).await.unwrap().unwrap();
        assert!(!removed.failed);
        assert!(locks.get_lock("doc").await.unwrap().is_none());
        assert_eq!(locks.remove_lock("doc", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn forced_removal_ignores_owner() {
        let store = MemoryBackend::new();
        let locks = manager(&store);
        locks.set_lock("doc", &Lock::new("a")).await.unwrap();
        let removed = locks.remove_lock("doc", None).await.unwrap().unwrap();
        assert_eq!(removed.owner, "a");
        assert!(!removed.failed);
    }

    #[tokio::test]
    async fn removal_announces_release() {
        let store = MemoryBackend::new();
        let locks = manager(&store);
        let mut sub = store.psubscribe("t:pubsub:*").await.unwrap();
        assert!(locks.acquire("doc", "a").await.unwrap());
        assert!(locks.release("doc", "a").await.unwrap());
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "t:pubsub:lock:doc");
        assert_eq!(msg.payload, Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn acquire_is_reentrant_for_the_same_owner() {
        let store = MemoryBackend::new();
        let locks = manager(&store);
        assert!(locks.acquire("doc", "a").await.unwrap());
        assert!(locks.acquire("doc", "a").await.unwrap());
        assert!(!locks.acquire("doc", "b").await.unwrap());
        assert!(!locks.release("doc", "b").await.unwrap());
        assert!(locks.release("doc", "a").await.unwrap());
        assert!(!locks.release("doc", "a").await.unwrap());
    }
}
