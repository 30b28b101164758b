//! Transient store: short-lived multi-part entries with a storage budget.
//!
//! An entry `key` of store `s` lives under `<ns>transient:<s>:` as
//!
//! - `<key>:summary`, a hash with `size`, `blobCount` and `completed`
//! - `<key>:params`, a hash of JSON parameter values
//! - `<key>:blobs`, a list of JSON [`BlobDescriptor`]s, in order
//!
//! and the store-wide counter `storageSize` holds the sum of all summary
//! sizes.  While an entry is in use it carries the first-level TTL;
//! [`TransientStore::release`] either moves it to the second-level TTL or,
//! when the store is over budget, deletes it on the spot.  Expired entries
//! are reclaimed by the backing store; the counter is not told, see
//! [`TransientStore::recompute_storage_size`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TransientStoreConfig;
use crate::error::{Error, Result};
use crate::metrics::{Metrics, StoreLabels};
use crate::namespace::{glob_escape, Namespace, Subsystem};
use crate::store::memory::Db;
use crate::store::{arg, arg_i64, arg_str, key, Backend, Reply, Script};

const SUMMARY: &str = "summary";
const PARAMS: &str = "params";
const BLOBS: &str = "blobs";
const STORAGE_SIZE: &str = "storageSize";

/// Where a blob's bytes live, plus what is needed to serve it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    /// Locator in external blob storage.
    pub locator: String,
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl BlobDescriptor {
    pub fn new(locator: impl Into<String>, length: u64) -> Self {
        Self {
            locator: locator.into(),
            length,
            filename: None,
            mime_type: None,
            encoding: None,
            digest: None,
        }
    }
}

/// What [`TransientStore::release`] did with the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Kept with the second-level TTL.
    Retained,
    /// Deleted because the store was over budget.
    Evicted,
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------
//
// Entry scripts take KEYS [summary, blobs, params, storageSize].

fn read_size(db: &mut Db, summary: &str) -> Result<i64> {
    match db.hget(summary, "size")? {
        None => Ok(0),
        Some(raw) => std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::contract(format!("size of {summary} is not a number"))),
    }
}

fn read_counter(db: &mut Db, k: &str) -> Result<i64> {
    match db.get(k)? {
        None => Ok(0),
        Some(raw) => std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::contract(format!("{k} is not a number"))),
    }
}

fn ttl_arg(args: &[Bytes], index: usize) -> Result<u64> {
    u64::try_from(arg_i64(args, index)?)
        .map_err(|_| Error::Backend(format!("script argument {} is negative", index + 1)))
}

/// ARGV: ttl, total size, descriptors...  Returns the new storage size.
static PERSIST_BLOBS: Script = Script {
    name: "transient_persist_blobs",
    lua: r#"
        local old = tonumber(redis.call('HGET', KEYS[1], 'size') or '0')
        local ttl = tonumber(ARGV[1])
        local total = tonumber(ARGV[2])
        redis.call('DEL', KEYS[2])
        for i = 3, #ARGV do
            redis.call('RPUSH', KEYS[2], ARGV[i])
        end
        redis.call('HSET', KEYS[1], 'size', total, 'blobCount', #ARGV - 2)
        redis.call('EXPIRE', KEYS[1], ttl)
        if #ARGV > 2 then
            redis.call('EXPIRE', KEYS[2], ttl)
        end
        if redis.call('EXISTS', KEYS[3]) == 1 then
            redis.call('EXPIRE', KEYS[3], ttl)
        end
        return redis.call('INCRBY', KEYS[4], total - old)
    "#,
    local: persist_blobs_local,
};

fn persist_blobs_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let (summary, blobs, params, size) = (key(keys, 0)?, key(keys, 1)?, key(keys, 2)?, key(keys, 3)?);
    let ttl = ttl_arg(args, 0)?;
    let total = arg_i64(args, 1)?;
    let old = read_size(db, summary)?;
    db.del(blobs);
    let descriptors = args.get(2..).unwrap_or_default();
    for descriptor in descriptors {
        db.rpush(blobs, descriptor.clone())?;
    }
    db.hset(summary, "size", Bytes::from(total.to_string()))?;
    db.hset(summary, "blobCount", Bytes::from(descriptors.len().to_string()))?;
    db.expire(summary, ttl);
    if !descriptors.is_empty() {
        db.expire(blobs, ttl);
    }
    if db.exists(params) {
        db.expire(params, ttl);
    }
    Ok(Reply::Int(db.incr_by(size, total - old)?))
}

/// KEYS: params.  ARGV: ttl, field, value, field, value...
static PUT_PARAMETERS: Script = Script {
    name: "transient_put_parameters",
    lua: r#"
        for i = 2, #ARGV, 2 do
            redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
        end
        redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
        return 1
    "#,
    local: put_parameters_local,
};

fn put_parameters_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let params = key(keys, 0)?;
    let ttl = ttl_arg(args, 0)?;
    let mut index = 1;
    while index < args.len() {
        db.hset(params, arg_str(args, index)?, arg(args, index + 1)?.clone())?;
        index += 2;
    }
    db.expire(params, ttl);
    Ok(Reply::Int(1))
}

/// KEYS: summary.  ARGV: ttl, "true" / "false".
static SET_COMPLETED: Script = Script {
    name: "transient_set_completed",
    lua: r#"
        redis.call('HSET', KEYS[1], 'completed', ARGV[2])
        redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
        return 1
    "#,
    local: set_completed_local,
};

fn set_completed_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let summary = key(keys, 0)?;
    db.hset(summary, "completed", arg(args, 1)?.clone())?;
    db.expire(summary, ttl_arg(args, 0)?);
    Ok(Reply::Int(1))
}

/// ARGV: second-level ttl, max size.  1 when kept, 0 when evicted.
static RELEASE: Script = Script {
    name: "transient_release",
    lua: r#"
        local total = tonumber(redis.call('GET', KEYS[4]) or '0')
        if total > tonumber(ARGV[2]) then
            local size = tonumber(redis.call('HGET', KEYS[1], 'size') or '0')
            redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
            redis.call('DECRBY', KEYS[4], size)
            return 0
        end
        local ttl = tonumber(ARGV[1])
        redis.call('EXPIRE', KEYS[1], ttl)
        redis.call('EXPIRE', KEYS[2], ttl)
        redis.call('EXPIRE', KEYS[3], ttl)
        return 1
    "#,
    local: release_local,
};

fn remove_entry(db: &mut Db, keys: &[String]) -> Result<()> {
    let (summary, blobs, params, size) = (key(keys, 0)?, key(keys, 1)?, key(keys, 2)?, key(keys, 3)?);
    let entry_size = read_size(db, summary)?;
    db.del(summary);
    db.del(blobs);
    db.del(params);
    db.incr_by(size, -entry_size)?;
    Ok(())
}

fn release_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let total = read_counter(db, key(keys, 3)?)?;
    if total > arg_i64(args, 1)? {
        remove_entry(db, keys)?;
        return Ok(Reply::Int(0));
    }
    let ttl = ttl_arg(args, 0)?;
    for index in 0..3 {
        db.expire(key(keys, index)?, ttl);
    }
    Ok(Reply::Int(1))
}

/// Deletes the entry and takes its size off the counter.
static REMOVE: Script = Script {
    name: "transient_remove",
    lua: r#"
        local size = tonumber(redis.call('HGET', KEYS[1], 'size') or '0')
        redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
        return redis.call('DECRBY', KEYS[4], size)
    "#,
    local: remove_local,
};

fn remove_local(db: &mut Db, keys: &[String], _args: &[Bytes]) -> Result<Reply> {
    remove_entry(db, keys)?;
    Ok(Reply::Int(read_counter(db, key(keys, 3)?)?))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct TransientStore {
    name: String,
    backend: Arc<dyn Backend>,
    prefix: String,
    config: TransientStoreConfig,
    metrics: Arc<Metrics>,
}

impl TransientStore {
    pub fn new(
        name: impl Into<String>,
        config: TransientStoreConfig,
        backend: Arc<dyn Backend>,
        ns: &Namespace,
        metrics: Arc<Metrics>,
    ) -> Self {
        let name = name.into();
        let prefix = format!("{}{name}:", ns.subsystem_prefix(Subsystem::Transient));
        Self {
            name,
            backend,
            prefix,
            config,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TransientStoreConfig {
        &self.config
    }

    fn part(&self, key: &str, part: &str) -> String {
        format!("{}{key}:{part}", self.prefix)
    }

    fn size_key(&self) -> String {
        format!("{}{STORAGE_SIZE}", self.prefix)
    }

    fn entry_keys(&self, key: &str) -> Vec<String> {
        vec![
            self.part(key, SUMMARY),
            self.part(key, BLOBS),
            self.part(key, PARAMS),
            self.size_key(),
        ]
    }

    fn first_ttl(&self) -> Bytes {
        Bytes::from(self.config.first_level_ttl_secs.to_string())
    }

    fn observe_size(&self, size: i64) {
        self.metrics
            .transient_storage_bytes
            .get_or_create(&StoreLabels {
                store: self.name.clone(),
            })
            .set(size);
    }

    /// `true` when the entry has a summary or parameters, whether or not
    /// blobs were persisted.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let found = self
            .backend
            .exists(&[self.part(key, SUMMARY), self.part(key, PARAMS)])
            .await?;
        Ok(found > 0)
    }

    // -- parameters -----------------------------------------------------------

    pub async fn put_parameter(
        &self,
        key: &str,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let mut params = HashMap::with_capacity(1);
        params.insert(name.to_string(), value.clone());
        self.put_parameters(key, &params).await
    }

    pub async fn put_parameters(
        &self,
        key: &str,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        if params.is_empty() {
            return Ok(());
        }
        let mut args = Vec::with_capacity(1 + params.len() * 2);
        args.push(self.first_ttl());
        for (name, value) in params {
            args.push(Bytes::from(name.clone()));
            args.push(Bytes::from(serde_json::to_vec(value)?));
        }
        self.backend
            .eval(&PUT_PARAMETERS, vec![self.part(key, PARAMS)], args)
            .await?;
        debug!(store = %self.name, %key, count = params.len(), "parameters stored");
        Ok(())
    }

    pub async fn get_parameter(&self, key: &str, name: &str) -> Result<Option<serde_json::Value>> {
        match self.backend.hget(&self.part(key, PARAMS), name).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_parameters(&self, key: &str) -> Result<HashMap<String, serde_json::Value>> {
        self.backend
            .hgetall(&self.part(key, PARAMS))
            .await?
            .into_iter()
            .map(|(name, raw)| Ok((name, serde_json::from_slice(&raw)?)))
            .collect()
    }

    // -- blobs ----------------------------------------------------------------

    /// Replace the blob list of `key` and record `total_size` as its size.
    /// `total_size` must equal the sum of the blob lengths.
    ///
    /// The storage counter moves by the difference with the size recorded
    /// before, read in the same script.  Returns the new storage size.
    pub async fn persist_blobs(
        &self,
        key: &str,
        total_size: u64,
        blobs: &[BlobDescriptor],
    ) -> Result<i64> {
        let sum: u64 = blobs.iter().map(|b| b.length).sum();
        if sum != total_size {
            return Err(Error::contract(format!(
                "size {total_size} of {key} does not match its blob lengths ({sum})"
            )));
        }
        let mut args = Vec::with_capacity(2 + blobs.len());
        args.push(self.first_ttl());
        args.push(Bytes::from(total_size.to_string()));
        for blob in blobs {
            args.push(Bytes::from(serde_json::to_vec(blob)?));
        }
        let storage = self
            .backend
            .eval(&PERSIST_BLOBS, self.entry_keys(key), args)
            .await?
            .into_int()?;
        self.observe_size(storage);
        debug!(store = %self.name, %key, total_size, blobs = blobs.len(), storage, "blobs persisted");
        Ok(storage)
    }

    pub async fn get_blobs(&self, key: &str) -> Result<Vec<BlobDescriptor>> {
        self.backend
            .lrange(&self.part(key, BLOBS), 0, -1)
            .await?
            .into_iter()
            .map(|raw| Ok(serde_json::from_slice(&raw)?))
            .collect()
    }

    /// Recorded size of the entry, `None` when it has no summary.
    pub async fn get_size(&self, key: &str) -> Result<Option<u64>> {
        match self.backend.hget(&self.part(key, SUMMARY), "size").await? {
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Some)
                .ok_or_else(|| Error::contract(format!("size of {key} is not a number"))),
            None => Ok(None),
        }
    }

    pub async fn is_completed(&self, key: &str) -> Result<bool> {
        let flag = self
            .backend
            .hget(&self.part(key, SUMMARY), "completed")
            .await?;
        Ok(flag.as_deref() == Some(&b"true"[..]))
    }

    pub async fn set_completed(&self, key: &str, completed: bool) -> Result<()> {
        self.backend
            .eval(
                &SET_COMPLETED,
                vec![self.part(key, SUMMARY)],
                vec![self.first_ttl(), Bytes::from(completed.to_string())],
            )
            .await?;
        Ok(())
    }

    // -- lifecycle ------------------------------------------------------------

    /// The caller is done with `key`.  Over budget the entry is deleted now;
    /// otherwise it is kept for the second-level TTL.
    pub async fn release(&self, key: &str) -> Result<Released> {
        let kept = self
            .backend
            .eval(
                &RELEASE,
                self.entry_keys(key),
                vec![
                    Bytes::from(self.config.second_level_ttl_secs.to_string()),
                    Bytes::from(self.config.max_size_bytes.to_string()),
                ],
            )
            .await?
            .into_int()?
            == 1;
        let outcome = if kept {
            Released::Retained
        } else {
            self.metrics.transient_evictions.inc();
            Released::Evicted
        };
        debug!(store = %self.name, %key, ?outcome, "released");
        Ok(outcome)
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let storage = self
            .backend
            .eval(&REMOVE, self.entry_keys(key), Vec::new())
            .await?
            .into_int()?;
        self.observe_size(storage);
        debug!(store = %self.name, %key, storage, "removed");
        Ok(())
    }

    /// Current value of the store-wide size counter.
    pub async fn storage_size(&self) -> Result<i64> {
        let size = match self.backend.get(&self.size_key()).await? {
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::contract("storage size is not a number"))?,
            None => 0,
        };
        self.observe_size(size);
        Ok(size)
    }

    /// Rebuild the size counter from the summaries still alive.
    ///
    /// Entries the store expired never decrement the counter, so it drifts
    /// upwards over time.  Writes racing with this call may be lost from the
    /// total until the next recompute.
    pub async fn recompute_storage_size(&self) -> Result<i64> {
        let pattern = format!("{}*:{SUMMARY}", glob_escape(&self.prefix));
        let mut total: i64 = 0;
        for summary in self.backend.scan_keys(&pattern).await? {
            if let Some(raw) = self.backend.hget(&summary, "size").await? {
                total += std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0);
            }
        }
        self.backend
            .set(&self.size_key(), Bytes::from(total.to_string()), None)
            .await?;
        self.observe_size(total);
        info!(store = %self.name, total, "storage size recomputed");
        Ok(total)
    }
}
