//! In-process store with Redis semantics for the subset of commands the
//! coordination layer uses.
//!
//! One mutex guards the whole dataset, so a script's native rendering runs
//! with the same all-or-nothing visibility a Lua script has on Redis.
//! Expiry is lazy: an expired key disappears the next time it is touched or
//! listed.  Published messages are fanned out through a broadcast bus after
//! the dataset lock is released.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Backend, ChannelMessage, Reply, Script, Subscription};
use crate::error::{Error, Result};

const BUS_CAPACITY: usize = 4096;
const SUBSCRIPTION_BUFFER: usize = 1024;

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Data {
    Str(Bytes),
    Hash(HashMap<String, Bytes>),
    List(VecDeque<Bytes>),
    Set(BTreeSet<String>),
}

impl Data {
    fn is_empty(&self) -> bool {
        match self {
            Self::Str(_) => false,
            Self::Hash(h) => h.is_empty(),
            Self::List(l) => l.is_empty(),
            Self::Set(s) => s.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type() -> Error {
    Error::Backend("WRONGTYPE Operation against a key holding the wrong kind of value".into())
}

fn not_an_integer() -> Error {
    Error::contract("value is not an integer or out of range")
}

/// The dataset, as seen by commands and by native script renderings.
#[derive(Debug, Default)]
pub struct Db {
    entries: HashMap<String, Entry>,
    outbox: Vec<ChannelMessage>,
}

impl Db {
    fn purge(&mut self, key: &str) {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    fn entry(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge(key);
        self.entries.get_mut(key)
    }

    fn entry_or(&mut self, key: &str, make: fn() -> Data) -> &mut Entry {
        self.purge(key);
        self.entries.entry(key.to_owned()).or_insert_with(|| Entry {
            data: make(),
            expires_at: None,
        })
    }

    /// Redis removes aggregate keys once they hold no elements.
    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|e| e.data.is_empty()) {
            self.entries.remove(key);
        }
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut HashMap<String, Bytes>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn hash_or_default(&mut self, key: &str) -> Result<&mut HashMap<String, Bytes>> {
        match &mut self.entry_or(key, || Data::Hash(HashMap::new())).data {
            Data::Hash(h) => Ok(h),
            _ => Err(wrong_type()),
        }
    }

    fn list(&mut self, key: &str) -> Result<Option<&mut VecDeque<Bytes>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::List(l),
                ..
            }) => Ok(Some(l)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn list_or_default(&mut self, key: &str) -> Result<&mut VecDeque<Bytes>> {
        match &mut self.entry_or(key, || Data::List(VecDeque::new())).data {
            Data::List(l) => Ok(l),
            _ => Err(wrong_type()),
        }
    }

    fn set_members(&mut self, key: &str) -> Result<Option<&mut BTreeSet<String>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Set(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn set_or_default(&mut self, key: &str) -> Result<&mut BTreeSet<String>> {
        match &mut self.entry_or(key, || Data::Set(BTreeSet::new())).data {
            Data::Set(s) => Ok(s),
            _ => Err(wrong_type()),
        }
    }

    // -- strings ------------------------------------------------------------

    pub fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Str(v), ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type()),
        }
    }

    pub fn set(&mut self, key: &str, value: Bytes, ttl_secs: Option<u64>) {
        let expires_at = ttl_secs.map(|t| Instant::now() + Duration::from_secs(t));
        self.entries.insert(
            key.to_owned(),
            Entry {
                data: Data::Str(value),
                expires_at,
            },
        );
    }

    pub fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        let current = match self.get(key)? {
            None => 0,
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(not_an_integer)?,
        };
        let next = current.checked_add(delta).ok_or_else(not_an_integer)?;
        let entry = self.entry_or(key, || Data::Str(Bytes::new()));
        entry.data = Data::Str(Bytes::from(next.to_string()));
        Ok(next)
    }

    // -- keys ---------------------------------------------------------------

    pub fn del(&mut self, key: &str) -> bool {
        self.purge(key);
        self.entries.remove(key).is_some()
    }

    pub fn exists(&mut self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    pub fn expire(&mut self, key: &str, ttl_secs: u64) -> bool {
        if ttl_secs == 0 {
            return self.del(key);
        }
        match self.entry(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                true
            }
            None => false,
        }
    }

    pub fn persist(&mut self, key: &str) -> bool {
        match self.entry(key) {
            Some(entry) => entry.expires_at.take().is_some(),
            None => false,
        }
    }

    pub fn keys(&mut self, pattern: &str) -> Vec<String> {
        let now = Instant::now();
        self.entries.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    // -- hashes -------------------------------------------------------------

    pub fn hget(&mut self, key: &str, field: &str) -> Result<Option<Bytes>> {
        Ok(self.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    /// Returns `true` when the field is new.
    pub fn hset(&mut self, key: &str, field: &str, value: Bytes) -> Result<bool> {
        Ok(self
            .hash_or_default(key)?
            .insert(field.to_owned(), value)
            .is_none())
    }

    pub fn hdel(&mut self, key: &str, field: &str) -> Result<bool> {
        let removed = match self.hash(key)? {
            Some(h) => h.remove(field).is_some(),
            None => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    pub fn hgetall(&mut self, key: &str) -> Result<HashMap<String, Bytes>> {
        Ok(self.hash(key)?.map(|h| h.clone()).unwrap_or_default())
    }

    // -- lists --------------------------------------------------------------

    pub fn lpush(&mut self, key: &str, value: Bytes) -> Result<usize> {
        let list = self.list_or_default(key)?;
        list.push_front(value);
        Ok(list.len())
    }

    pub fn rpush(&mut self, key: &str, value: Bytes) -> Result<usize> {
        let list = self.list_or_default(key)?;
        list.push_back(value);
        Ok(list.len())
    }

    pub fn rpop(&mut self, key: &str) -> Result<Option<Bytes>> {
        let popped = match self.list(key)? {
            Some(l) => l.pop_back(),
            None => None,
        };
        self.drop_if_empty(key);
        Ok(popped)
    }

    /// `LREM key 0 value`: removes every occurrence.
    pub fn lrem(&mut self, key: &str, value: &[u8]) -> Result<usize> {
        let removed = match self.list(key)? {
            Some(l) => {
                let before = l.len();
                l.retain(|v| v.as_ref() != value);
                before - l.len()
            }
            None => 0,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    pub fn llen(&mut self, key: &str) -> Result<usize> {
        Ok(self.list(key)?.map_or(0, |l| l.len()))
    }

    pub fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        let Some(list) = self.list(key)? else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let norm = |i: i64| if i < 0 { len + i } else { i };
        let start = norm(start).max(0);
        let stop = norm(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    // -- sets ---------------------------------------------------------------

    pub fn sadd(&mut self, key: &str, member: &str) -> Result<bool> {
        Ok(self.set_or_default(key)?.insert(member.to_owned()))
    }

    pub fn srem(&mut self, key: &str, member: &str) -> Result<bool> {
        let removed = match self.set_members(key)? {
            Some(s) => s.remove(member),
            None => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    pub fn scard(&mut self, key: &str) -> Result<usize> {
        Ok(self.set_members(key)?.map_or(0, |s| s.len()))
    }

    pub fn smembers(&mut self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .set_members(key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    // -- pub/sub ------------------------------------------------------------

    /// Queue a message; it is delivered once the current command completes.
    pub fn publish(&mut self, channel: &str, payload: Bytes) {
        self.outbox.push(ChannelMessage {
            channel: channel.to_owned(),
            payload,
        });
    }
}

/// Redis-style glob match: `*`, `?`, `[...]` classes with ranges and `^`
/// negation, and `\` escapes.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    match_bytes(pattern.as_bytes(), text.as_bytes())
}

fn match_bytes(p: &[u8], t: &[u8]) -> bool {
    match p {
        [] => t.is_empty(),
        [b'*', ..] => {
            let rest = p.iter().position(|&c| c != b'*').map_or(&p[p.len()..], |i| &p[i..]);
            rest.is_empty() || (0..=t.len()).any(|i| match_bytes(rest, &t[i..]))
        }
        [b'?', rest @ ..] => !t.is_empty() && match_bytes(rest, &t[1..]),
        [b'[', class @ ..] => match t.split_first() {
            Some((&c, t_rest)) => {
                let (matched, rest) = match_class(class, c);
                matched && match_bytes(rest, t_rest)
            }
            None => false,
        },
        [b'\\', literal, rest @ ..] => t.first() == Some(literal) && match_bytes(rest, &t[1..]),
        [literal, rest @ ..] => t.first() == Some(literal) && match_bytes(rest, &t[1..]),
    }
}

/// Match `c` against the class body following `[`.  Returns the verdict and
/// the pattern after the closing `]`; an unterminated class runs to the end.
fn match_class(mut p: &[u8], c: u8) -> (bool, &[u8]) {
    let negate = p.first() == Some(&b'^');
    if negate {
        p = &p[1..];
    }
    let mut matched = false;
    loop {
        match p {
            [] => break,
            [b']', rest @ ..] => {
                p = rest;
                break;
            }
            [b'\\', literal, rest @ ..] => {
                matched |= *literal == c;
                p = rest;
            }
            [lo, b'-', hi, rest @ ..] if *hi != b']' => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                matched |= (lo..=hi).contains(&c);
                p = rest;
            }
            [literal, rest @ ..] => {
                matched |= *literal == c;
                p = rest;
            }
        }
    }
    (matched != negate, p)
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

struct Shared {
    db: Mutex<Db>,
    bus: broadcast::Sender<ChannelMessage>,
    outage: AtomicBool,
    stall_subscriptions: AtomicBool,
}

/// Shared in-process store.  Clones are handles onto the same dataset.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                db: Mutex::new(Db::default()),
                bus,
                outage: AtomicBool::new(false),
                stall_subscriptions: AtomicBool::new(false),
            }),
        }
    }

    /// Failure injection: while set, every command fails with
    /// [`Error::Connection`].
    pub fn set_outage(&self, down: bool) {
        self.shared.outage.store(down, Ordering::SeqCst);
    }

    /// Failure injection: while set, new subscriptions never get their
    /// acknowledgement.
    pub fn stall_subscriptions(&self, stalled: bool) {
        self.shared
            .stall_subscriptions
            .store(stalled, Ordering::SeqCst);
    }

    /// Number of live subscriptions on this store.
    pub fn subscriber_count(&self) -> usize {
        self.shared.bus.receiver_count()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.shared.outage.load(Ordering::SeqCst) {
            return Err(Error::Connection("memory store outage".into()));
        }
        Ok(())
    }

    fn with_db<T>(&self, f: impl FnOnce(&mut Db) -> Result<T>) -> Result<T> {
        self.check_reachable()?;
        let (result, outbox) = {
            let mut db = self.shared.db.lock();
            let result = f(&mut db);
            (result, std::mem::take(&mut db.outbox))
        };
        for message in outbox {
            // No receivers is not an error for PUBLISH.
            let _ = self.shared.bus.send(message);
        }
        result
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.with_db(|db| db.get(key))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        // MGET never fails on type; non-strings read as nil.
        self.with_db(|db| Ok(keys.iter().map(|k| db.get(k).ok().flatten()).collect()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<u64>) -> Result<()> {
        self.with_db(|db| {
            db.set(key, value, ttl);
            Ok(())
        })
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.with_db(|db| Ok(keys.iter().filter(|k| db.del(k)).count() as u64))
    }

    async fn exists(&self, keys: &[String]) -> Result<u64> {
        self.with_db(|db| Ok(keys.iter().filter(|k| db.exists(k)).count() as u64))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        self.with_db(|db| Ok(db.expire(key, ttl_secs)))
    }

    async fn persist(&self, key: &str) -> Result<bool> {
        self.with_db(|db| Ok(db.persist(key)))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.with_db(|db| db.incr_by(key, delta))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>> {
        self.with_db(|db| db.hget(key, field))
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<bool> {
        self.with_db(|db| db.hset(key, field, value))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<u64> {
        self.with_db(|db| Ok(u64::from(db.hdel(key, field)?)))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Bytes>> {
        self.with_db(|db| db.hgetall(key))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        self.with_db(|db| db.lrange(key, start, stop))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.with_db(|db| db.smembers(key))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.with_db(|db| Ok(db.keys(pattern)))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.with_db(|db| {
            db.publish(channel, payload);
            Ok(())
        })
    }

    async fn eval(
        &self,
        script: &'static Script,
        keys: Vec<String>,
        args: Vec<Bytes>,
    ) -> Result<Reply> {
        debug!(script = script.name, ?keys, "memory eval");
        self.with_db(|db| (script.local)(db, &keys, &args))
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription> {
        self.check_reachable()?;
        if self.shared.stall_subscriptions.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let mut bus = self.shared.bus.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pattern = pattern.to_owned();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    received = bus.recv() => match received {
                        Ok(message) => {
                            if glob_match(&pattern, &message.channel)
                                && tx.send(message).await.is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%pattern, skipped, "memory subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(%pattern, "memory subscription closed");
        });
        Ok(Subscription::new(rx, forwarder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("app:pubsub:*", "app:pubsub:inval:default"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("*:summary", "x:y:summary"));
        assert!(!glob_match("app:pubsub:*", "app:lock:x"));
        assert!(!glob_match("a?c", "ac"));
    }

    #[test]
    fn glob_classes_and_escapes() {
        assert!(glob_match("h[ae]llo", "hello"));
        assert!(!glob_match("h[ae]llo", "hillo"));
        assert!(glob_match("h[^e]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("h[a-c]llo", "hbllo"));
        assert!(!glob_match("h[a-c]llo", "hdllo"));
        assert!(glob_match("x[\\]]y", "x]y"));
        assert!(glob_match("a\\*b", "a*b"));
        assert!(!glob_match("a\\*b", "axb"));
        assert!(glob_match("a\\?*", "a?zz"));
        assert!(glob_match("**x", "abx"));
    }

    #[test]
    fn escaped_prefix_matches_only_its_own_keys() {
        let mut db = Db::default();
        db.set("t[1]:kv:a", Bytes::from_static(b"1"), None);
        db.set("t1:kv:b", Bytes::from_static(b"2"), None);
        db.set("t*:kv:c", Bytes::from_static(b"3"), None);
        let pattern = format!("{}*", crate::namespace::glob_escape("t[1]:kv:"));
        assert_eq!(db.keys(&pattern), vec!["t[1]:kv:a".to_string()]);
        let pattern = format!("{}*", crate::namespace::glob_escape("t*:kv:"));
        assert_eq!(db.keys(&pattern), vec!["t*:kv:c".to_string()]);
    }

    #[test]
    fn aggregates_disappear_when_empty() {
        let mut db = Db::default();
        db.sadd("s", "a").unwrap();
        db.srem("s", "a").unwrap();
        assert!(!db.exists("s"));

        db.rpush("l", Bytes::from_static(b"x")).unwrap();
        db.rpop("l").unwrap();
        assert!(!db.exists("l"));
    }

    #[test]
    fn wrong_type_is_reported() {
        let mut db = Db::default();
        db.set("k", Bytes::from_static(b"v"), None);
        assert!(db.hget("k", "f").is_err());
        assert!(db.lpush("k", Bytes::new()).is_err());
    }

    #[test]
    fn incr_rejects_non_numeric() {
        let mut db = Db::default();
        db.set("n", Bytes::from_static(b"abc"), None);
        assert!(matches!(db.incr_by("n", 1), Err(Error::Contract(_))));
        assert_eq!(db.incr_by("fresh", 5).unwrap(), 5);
    }

    #[test]
    fn lrange_handles_negative_indices() {
        let mut db = Db::default();
        for v in ["a", "b", "c"] {
            db.rpush("l", Bytes::from(v)).unwrap();
        }
        let all: Vec<Bytes> = db.lrange("l", 0, -1).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(db.lrange("l", -2, -1).unwrap()[0], Bytes::from("b"));
        assert!(db.lrange("l", 5, 10).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_lazily() {
        let mut db = Db::default();
        db.set("k", Bytes::from_static(b"v"), Some(10));
        assert!(db.exists("k"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!db.exists("k"));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers() {
        let store = MemoryBackend::new();
        let mut sub = store.psubscribe("ns:pubsub:*").await.unwrap();
        store
            .publish("ns:other", Bytes::from_static(b"ignored"))
            .await
            .unwrap();
        store
            .publish("ns:pubsub:t", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "ns:pubsub:t");
        assert_eq!(msg.payload, Bytes::from_static(b"hello"));
        sub.close().await;
    }

    #[tokio::test]
    async fn hash_fields_through_the_backend() {
        let store = MemoryBackend::new();
        assert!(store.hset("h", "f", Bytes::from_static(b"1")).await.unwrap());
        assert!(!store.hset("h", "f", Bytes::from_static(b"2")).await.unwrap());
        assert_eq!(store.hget("h", "f").await.unwrap(), Some(Bytes::from_static(b"2")));
        assert_eq!(store.hdel("h", "f").await.unwrap(), 1);
        assert_eq!(store.exists(&["h".to_string()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outage_fails_commands() {
        let store = MemoryBackend::new();
        store.set_outage(true);
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_connectivity());
        store.set_outage(false);
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
