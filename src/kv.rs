//! Key/value store with atomic compare-and-set.
//!
//! Keys are namespaced under `<ns>kv:`.  A TTL of `0` means "no expiry".
//! Each compare-and-set call runs exactly one of three scripts, picked by
//! which of `expected` / `new` are absent; the returned boolean says whether
//! this call changed the stored value.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_stream::Stream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::metrics::{CasLabels, CasOutcome, Metrics};
use crate::namespace::{Namespace, Subsystem};
use crate::store::memory::Db;
use crate::store::{arg, arg_i64, key, Backend, Reply, Script};

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

fn ttl_option(ttl: i64) -> Option<u64> {
    u64::try_from(ttl).ok().filter(|t| *t > 0)
}

/// KEYS: value.  ARGV: new, ttl.
static CAS_CREATE: Script = Script {
    name: "kv_cas_create",
    lua: r#"
        if redis.call('EXISTS', KEYS[1]) == 1 then
            return 0
        end
        local ttl = tonumber(ARGV[2])
        if ttl > 0 then
            redis.call('SET', KEYS[1], ARGV[1], 'EX', ttl)
        else
            redis.call('SET', KEYS[1], ARGV[1])
        end
        return 1
    "#,
    local: cas_create_local,
};

fn cas_create_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let k = key(keys, 0)?;
    if db.exists(k) {
        return Ok(Reply::Int(0));
    }
    db.set(k, arg(args, 0)?.clone(), ttl_option(arg_i64(args, 1)?));
    Ok(Reply::Int(1))
}

/// KEYS: value.  ARGV: expected.
static CAS_DELETE: Script = Script {
    name: "kv_cas_delete",
    lua: r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            redis.call('DEL', KEYS[1])
            return 1
        end
        return 0
    "#,
    local: cas_delete_local,
};

fn cas_delete_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let k = key(keys, 0)?;
    if db.get(k)?.as_ref() == Some(arg(args, 0)?) {
        db.del(k);
        return Ok(Reply::Int(1));
    }
    Ok(Reply::Int(0))
}

/// KEYS: value.  ARGV: expected, new, ttl.
static CAS_SWAP: Script = Script {
    name: "kv_cas_swap",
    lua: r#"
        if redis.call('GET', KEYS[1]) ~= ARGV[1] then
            return 0
        end
        local ttl = tonumber(ARGV[3])
        if ttl > 0 then
            redis.call('SET', KEYS[1], ARGV[2], 'EX', ttl)
        else
            redis.call('SET', KEYS[1], ARGV[2])
        end
        return 1
    "#,
    local: cas_swap_local,
};

fn cas_swap_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let k = key(keys, 0)?;
    if db.get(k)?.as_ref() != Some(arg(args, 0)?) {
        return Ok(Reply::Int(0));
    }
    db.set(k, arg(args, 1)?.clone(), ttl_option(arg_i64(args, 2)?));
    Ok(Reply::Int(1))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct KeyValueStore {
    backend: Arc<dyn Backend>,
    ns: Namespace,
    metrics: Arc<Metrics>,
}

impl KeyValueStore {
    pub fn new(backend: Arc<dyn Backend>, ns: Namespace, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            ns,
            metrics,
        }
    }

    fn key(&self, key: &str) -> String {
        self.ns.key(Subsystem::Kv, key)
    }

    // -- reads --------------------------------------------------------------

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.backend.get(&self.key(key)).await
    }

    /// Values of the keys that exist.  Missing keys are left out.
    pub async fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, Bytes>> {
        let full: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        let values = self.backend.mget(&full).await?;
        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(k, v)| v.map(|v| ((*k).to_string(), v)))
            .collect())
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.get(key).await?.map(|v| utf8(key, v)).transpose()
    }

    pub async fn get_strings(&self, keys: &[&str]) -> Result<HashMap<String, String>> {
        self.get_many(keys)
            .await?
            .into_iter()
            .map(|(k, v)| {
                let s = utf8(&k, v)?;
                Ok((k, s))
            })
            .collect()
    }

    pub async fn get_long(&self, key: &str) -> Result<Option<i64>> {
        self.get(key).await?.map(|v| long(key, v)).transpose()
    }

    pub async fn get_longs(&self, keys: &[&str]) -> Result<HashMap<String, i64>> {
        self.get_many(keys)
            .await?
            .into_iter()
            .map(|(k, v)| {
                let n = long(&k, v)?;
                Ok((k, n))
            })
            .collect()
    }

    // -- writes -------------------------------------------------------------

    /// Store `value` under `key`.  `None` deletes the key.
    pub async fn put(&self, key: &str, value: Option<Bytes>, ttl: u64) -> Result<()> {
        let full = self.key(key);
        match value {
            Some(value) => {
                self.backend
                    .set(&full, value, (ttl > 0).then_some(ttl))
                    .await?
            }
            None => {
                self.backend.del(&[full]).await?;
            }
        }
        debug!(%key, ttl, "kv put");
        Ok(())
    }

    pub async fn put_string(&self, key: &str, value: Option<&str>, ttl: u64) -> Result<()> {
        self.put(key, value.map(|v| Bytes::copy_from_slice(v.as_bytes())), ttl)
            .await
    }

    pub async fn put_long(&self, key: &str, value: i64, ttl: u64) -> Result<()> {
        self.put(key, Some(Bytes::from(value.to_string())), ttl)
            .await
    }

    /// Atomically replace the value of `key` with `new` if it currently
    /// equals `expected`.  `None` stands for "absent" on either side.
    pub async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
        ttl: u64,
    ) -> Result<bool> {
        let full = self.key(key);
        let ttl_arg = Bytes::from(ttl.to_string());
        let reply = match (expected, new) {
            (None, None) => {
                // Nothing to change; the comparison alone decides.
                let absent = self.backend.exists(&[full]).await? == 0;
                self.record_cas(absent);
                return Ok(absent);
            }
            (None, Some(new)) => {
                self.backend
                    .eval(
                        &CAS_CREATE,
                        vec![full],
                        vec![Bytes::copy_from_slice(new), ttl_arg],
                    )
                    .await?
            }
            (Some(expected), None) => {
                self.backend
                    .eval(&CAS_DELETE, vec![full], vec![Bytes::copy_from_slice(expected)])
                    .await?
            }
            (Some(expected), Some(new)) => {
                self.backend
                    .eval(
                        &CAS_SWAP,
                        vec![full],
                        vec![
                            Bytes::copy_from_slice(expected),
                            Bytes::copy_from_slice(new),
                            ttl_arg,
                        ],
                    )
                    .await?
            }
        };
        let swapped = reply.into_int()? == 1;
        self.record_cas(swapped);
        debug!(%key, swapped, "kv compare_and_set");
        Ok(swapped)
    }

    pub async fn compare_and_set_string(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: u64,
    ) -> Result<bool> {
        self.compare_and_set(key, expected.map(str::as_bytes), new.map(str::as_bytes), ttl)
            .await
    }

    fn record_cas(&self, swapped: bool) {
        let outcome = if swapped {
            CasOutcome::Swapped
        } else {
            CasOutcome::Mismatch
        };
        self.metrics
            .kv_cas
            .get_or_create(&CasLabels { outcome })
            .inc();
    }

    /// Atomic increment.  A missing key counts as `0`; a non-numeric value
    /// fails with [`Error::Contract`].
    pub async fn add_and_get(&self, key: &str, delta: i64) -> Result<i64> {
        self.backend.incr_by(&self.key(key), delta).await
    }

    /// Change the expiry of an existing key.  `0` removes the expiry.
    pub async fn set_ttl(&self, key: &str, ttl: u64) -> Result<()> {
        let full = self.key(key);
        if ttl == 0 {
            self.backend.persist(&full).await?;
        } else {
            self.backend.expire(&full, ttl).await?;
        }
        Ok(())
    }

    // -- enumeration ----------------------------------------------------------

    /// Every key of the store, captured when the call is made.  Keys written
    /// afterwards are not seen.
    pub async fn key_stream(&self) -> Result<impl Stream<Item = String>> {
        self.key_stream_prefix("").await
    }

    /// Like [`KeyValueStore::key_stream`], restricted to keys starting with
    /// `prefix`.
    pub async fn key_stream_prefix(&self, prefix: &str) -> Result<impl Stream<Item = String>> {
        let keys = self.snapshot_keys().await?;
        let head = self.ns.subsystem_prefix(Subsystem::Kv);
        let keys: Vec<String> = keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(head.as_str()).map(String::from))
            .filter(|k| k.starts_with(prefix))
            .collect();
        Ok(tokio_stream::iter(keys))
    }

    async fn snapshot_keys(&self) -> Result<Vec<String>> {
        let pattern = self.ns.subsystem_pattern(Subsystem::Kv);
        self.backend.scan_keys(&pattern).await
    }

    /// Delete every key of the store.
    pub async fn clear(&self) -> Result<()> {
        let keys = self.snapshot_keys().await?;
        let removed = self.backend.del(&keys).await?;
        debug!(removed, "kv cleared");
        Ok(())
    }
}

fn utf8(key: &str, value: Bytes) -> Result<String> {
    String::from_utf8(value.to_vec())
        .map_err(|_| Error::contract(format!("value of {key} is not valid UTF-8")))
}

fn long(key: &str, value: Bytes) -> Result<i64> {
    std::str::from_utf8(&value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::contract(format!("value of {key} is not a number")))
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::store::memory::MemoryBackend;

    fn store() -> KeyValueStore {
        KeyValueStore::new(
            Arc::new(MemoryBackend::new()),
            Namespace::new("t:"),
            MetricsRegistry::new().metrics,
        )
    }

    #[tokio::test]
    async fn put_none_deletes() {
        let kv = store();
        kv.put_string("a", Some("1"), 0).await.unwrap();
        assert_eq!(kv.get_string("a").await.unwrap().as_deref(), Some("1"));
        kv.put("a", None, 0).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_many_skips_missing() {
        let kv = store();
        kv.put_long("x", 1, 0).await.unwrap();
        kv.put_long("y", 2, 0).await.unwrap();
        let longs = kv.get_longs(&["x", "y", "z"]).await.unwrap();
        assert_eq!(longs.len(), 2);
        assert_eq!(longs["y"], 2);
    }

    #[tokio::test]
    async fn cas_variants() {
        let kv = store();
        // create-if-absent
        assert!(kv.compare_and_set_string("k", None, Some("v1"), 0).await.unwrap());
        assert!(!kv.compare_and_set_string("k", None, Some("v2"), 0).await.unwrap());
        // swap-if-matches
        assert!(!kv.compare_and_set_string("k", Some("nope"), Some("v2"), 0).await.unwrap());
        assert!(kv.compare_and_set_string("k", Some("v1"), Some("v2"), 0).await.unwrap());
        assert_eq!(kv.get_string("k").await.unwrap().as_deref(), Some("v2"));
        // delete-if-matches
        assert!(!kv.compare_and_set_string("k", Some("v1"), None, 0).await.unwrap());
        assert!(kv.compare_and_set_string("k", Some("v2"), None, 0).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
        // absent -> absent
        assert!(kv.compare_and_set("k", None, None, 0).await.unwrap());
    }

    #[tokio::test]
    async fn add_and_get_rejects_text() {
        let kv = store();
        assert_eq!(kv.add_and_get("n", 5).await.unwrap(), 5);
        assert_eq!(kv.add_and_get("n", -2).await.unwrap(), 3);
        kv.put_string("s", Some("abc"), 0).await.unwrap();
        assert!(matches!(kv.add_and_get("s", 1).await, Err(Error::Contract(_))));
        assert!(matches!(kv.get_long("s").await, Err(Error::Contract(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_and_persist_clears_it() {
        let kv = store();
        kv.put_string("short", Some("x"), 5).await.unwrap();
        kv.put_string("kept", Some("y"), 5).await.unwrap();
        kv.set_ttl("kept", 0).await.unwrap();
        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        assert_eq!(kv.get("short").await.unwrap(), None);
        assert!(kv.get("kept").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn key_stream_is_a_snapshot() {
        let kv = store();
        kv.put_string("a/1", Some("x"), 0).await.unwrap();
        kv.put_string("a/2", Some("x"), 0).await.unwrap();
        kv.put_string("b/1", Some("x"), 0).await.unwrap();
        let stream = kv.key_stream_prefix("a/").await.unwrap();
        kv.put_string("a/3", Some("x"), 0).await.unwrap();
        let keys: Vec<String> = stream.collect().await;
        assert_eq!(keys, vec!["a/1", "a/2"]);

        kv.clear().await.unwrap();
        let keys: Vec<String> = kv.key_stream().await.unwrap().collect().await;
        assert!(keys.is_empty());
    }
}
