//! Cluster-shared work queues.
//!
//! Per queue `q` the store holds, under `<ns>work:<q>:`:
//!
//! | key         | type    | content                                  |
//! |-------------|---------|------------------------------------------|
//! | `scheduled` | list    | ids waiting, newest at the head          |
//! | `running`   | set     | ids being worked on                      |
//! | `data`      | hash    | id -> opaque payload                     |
//! | `state`     | hash    | id -> state tag (`S` / `R`)              |
//! | `completed` | counter | items completed                          |
//! | `canceled`  | counter | items canceled                           |
//!
//! Completed and canceled items are only counted.  Every transition is one
//! script, so a poll on another node never sees an id half moved.
//!
//! Nodes cannot cheaply be woken by another node's `schedule`, so a poller
//! re-tries the store after a jittered wait; a local `schedule` wakes local
//! pollers at once.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WorkConfig;
use crate::error::{Error, Result};
use crate::metrics::{Metrics, Transition};
use crate::namespace::{Namespace, Subsystem};
use crate::store::memory::Db;
use crate::store::{arg, arg_str, key, Backend, Reply, Script};

/// How long one wait of [`WorkQueue::take`] lasts before it loops.
const TAKE_SLICE: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkState {
    Scheduled,
    Running,
    Completed,
    Canceled,
}

impl WorkState {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Scheduled => "S",
            Self::Running => "R",
            Self::Completed => "C",
            Self::Canceled => "X",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Result<Self> {
        match tag {
            b"S" => Ok(Self::Scheduled),
            b"R" => Ok(Self::Running),
            b"C" => Ok(Self::Completed),
            b"X" => Ok(Self::Canceled),
            other => Err(Error::contract(format!(
                "unknown work state tag {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// A unit of work.  The payload is opaque to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub queue: String,
    pub payload: Bytes,
}

impl WorkItem {
    pub fn new(queue: impl Into<String>, id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub scheduled: u64,
    pub running: u64,
    pub completed: u64,
    pub canceled: u64,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub poll_jitter: RangeInclusive<Duration>,
    pub quiet_log_interval: Duration,
}

impl QueueConfig {
    /// Queue `name` with the process-wide polling settings.
    pub fn new(name: impl Into<String>, work: &WorkConfig) -> Self {
        Self {
            name: name.into(),
            poll_jitter: Duration::from_millis(work.poll_jitter_min_ms)
                ..=Duration::from_millis(work.poll_jitter_max_ms),
            quiet_log_interval: Duration::from_secs(work.quiet_log_interval_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------
//
// KEYS is always [scheduled, running, data, state, completed, canceled].

const SCHEDULED: usize = 0;
const RUNNING: usize = 1;
const DATA: usize = 2;
const STATE: usize = 3;
const COMPLETED: usize = 4;
const CANCELED: usize = 5;

fn state_tag(db: &mut Db, keys: &[String], id: &str) -> Result<Option<Bytes>> {
    db.hget(key(keys, STATE)?, id)
}

/// ARGV: id, payload.  0 when the id is already scheduled or running.
static SCHEDULE: Script = Script {
    name: "work_schedule",
    lua: r#"
        local state = redis.call('HGET', KEYS[4], ARGV[1])
        if state == 'S' or state == 'R' then
            return 0
        end
        redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
        redis.call('HSET', KEYS[4], ARGV[1], 'S')
        redis.call('LPUSH', KEYS[1], ARGV[1])
        return 1
    "#,
    local: schedule_local,
};

fn schedule_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let id = arg_str(args, 0)?;
    if matches!(state_tag(db, keys, id)?.as_deref(), Some(b"S" | b"R")) {
        return Ok(Reply::Int(0));
    }
    db.hset(key(keys, DATA)?, id, arg(args, 1)?.clone())?;
    db.hset(key(keys, STATE)?, id, Bytes::from_static(b"S"))?;
    db.lpush(key(keys, SCHEDULED)?, Bytes::copy_from_slice(id.as_bytes()))?;
    Ok(Reply::Int(1))
}

/// Oldest scheduled id moves to running.  Returns `{id, payload}` or nil.
static POP: Script = Script {
    name: "work_pop",
    lua: r#"
        local id = redis.call('RPOP', KEYS[1])
        if not id then
            return false
        end
        redis.call('SADD', KEYS[2], id)
        redis.call('HSET', KEYS[4], id, 'R')
        local data = redis.call('HGET', KEYS[3], id)
        if not data then
            data = ''
        end
        return {id, data}
    "#,
    local: pop_local,
};

fn pop_local(db: &mut Db, keys: &[String], _args: &[Bytes]) -> Result<Reply> {
    let Some(raw) = db.rpop(key(keys, SCHEDULED)?)? else {
        return Ok(Reply::Nil);
    };
    let id = std::str::from_utf8(&raw)
        .map_err(|_| Error::contract("scheduled id is not valid UTF-8"))?
        .to_owned();
    db.sadd(key(keys, RUNNING)?, &id)?;
    db.hset(key(keys, STATE)?, &id, Bytes::from_static(b"R"))?;
    let data = db.hget(key(keys, DATA)?, &id)?.unwrap_or_default();
    Ok(Reply::Array(vec![Reply::Data(raw), Reply::Data(data)]))
}

/// ARGV: id, payload.  Puts the id in running wherever it was.  0 when it
/// was already running.
static MARK_RUNNING: Script = Script {
    name: "work_mark_running",
    lua: r#"
        local state = redis.call('HGET', KEYS[4], ARGV[1])
        redis.call('LREM', KEYS[1], 0, ARGV[1])
        redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
        redis.call('HSET', KEYS[4], ARGV[1], 'R')
        redis.call('SADD', KEYS[2], ARGV[1])
        if state == 'R' then
            return 0
        end
        return 1
    "#,
    local: mark_running_local,
};

fn mark_running_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let id = arg_str(args, 0)?;
    let was_running = state_tag(db, keys, id)?.as_deref() == Some(&b"R"[..]);
    db.lrem(key(keys, SCHEDULED)?, id.as_bytes())?;
    db.hset(key(keys, DATA)?, id, arg(args, 1)?.clone())?;
    db.hset(key(keys, STATE)?, id, Bytes::from_static(b"R"))?;
    db.sadd(key(keys, RUNNING)?, id)?;
    Ok(Reply::Int(if was_running { 0 } else { 1 }))
}

/// ARGV: id.  Only a running id completes.
static MARK_COMPLETED: Script = Script {
    name: "work_mark_completed",
    lua: r#"
        if redis.call('HGET', KEYS[4], ARGV[1]) ~= 'R' then
            return 0
        end
        redis.call('SREM', KEYS[2], ARGV[1])
        redis.call('HDEL', KEYS[3], ARGV[1])
        redis.call('HDEL', KEYS[4], ARGV[1])
        redis.call('INCR', KEYS[5])
        return 1
    "#,
    local: mark_completed_local,
};

fn mark_completed_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let id = arg_str(args, 0)?;
    if state_tag(db, keys, id)?.as_deref() != Some(&b"R"[..]) {
        return Ok(Reply::Int(0));
    }
    db.srem(key(keys, RUNNING)?, id)?;
    db.hdel(key(keys, DATA)?, id)?;
    db.hdel(key(keys, STATE)?, id)?;
    db.incr_by(key(keys, COMPLETED)?, 1)?;
    Ok(Reply::Int(1))
}

/// ARGV: id.  A scheduled or running id is dropped and counted.
static MARK_CANCELED: Script = Script {
    name: "work_mark_canceled",
    lua: r#"
        local state = redis.call('HGET', KEYS[4], ARGV[1])
        if state ~= 'S' and state ~= 'R' then
            return 0
        end
        redis.call('LREM', KEYS[1], 0, ARGV[1])
        redis.call('SREM', KEYS[2], ARGV[1])
        redis.call('HDEL', KEYS[3], ARGV[1])
        redis.call('HDEL', KEYS[4], ARGV[1])
        redis.call('INCR', KEYS[6])
        return 1
    "#,
    local: mark_canceled_local,
};

fn mark_canceled_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let id = arg_str(args, 0)?;
    if !matches!(state_tag(db, keys, id)?.as_deref(), Some(b"S" | b"R")) {
        return Ok(Reply::Int(0));
    }
    db.lrem(key(keys, SCHEDULED)?, id.as_bytes())?;
    db.srem(key(keys, RUNNING)?, id)?;
    db.hdel(key(keys, DATA)?, id)?;
    db.hdel(key(keys, STATE)?, id)?;
    db.incr_by(key(keys, CANCELED)?, 1)?;
    Ok(Reply::Int(1))
}

/// ARGV: id, payload.  A running id goes back to the tail of the queue.
static RESCHEDULE: Script = Script {
    name: "work_reschedule",
    lua: r#"
        if redis.call('HGET', KEYS[4], ARGV[1]) ~= 'R' then
            return 0
        end
        redis.call('SREM', KEYS[2], ARGV[1])
        redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
        redis.call('HSET', KEYS[4], ARGV[1], 'S')
        redis.call('LPUSH', KEYS[1], ARGV[1])
        return 1
    "#,
    local: reschedule_local,
};

fn reschedule_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let id = arg_str(args, 0)?;
    if state_tag(db, keys, id)?.as_deref() != Some(&b"R"[..]) {
        return Ok(Reply::Int(0));
    }
    db.srem(key(keys, RUNNING)?, id)?;
    db.hset(key(keys, DATA)?, id, arg(args, 1)?.clone())?;
    db.hset(key(keys, STATE)?, id, Bytes::from_static(b"S"))?;
    db.lpush(key(keys, SCHEDULED)?, Bytes::copy_from_slice(id.as_bytes()))?;
    Ok(Reply::Int(1))
}

/// `{scheduled, running, completed, canceled}` in one snapshot.
static METRICS: Script = Script {
    name: "work_metrics",
    lua: r#"
        local completed = tonumber(redis.call('GET', KEYS[5]) or '0')
        local canceled = tonumber(redis.call('GET', KEYS[6]) or '0')
        return {
            redis.call('LLEN', KEYS[1]),
            redis.call('SCARD', KEYS[2]),
            completed,
            canceled,
        }
    "#,
    local: metrics_local,
};

fn counter(db: &mut Db, k: &str) -> Result<i64> {
    match db.get(k)? {
        None => Ok(0),
        Some(raw) => std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::contract(format!("counter {k} is not a number"))),
    }
}

fn metrics_local(db: &mut Db, keys: &[String], _args: &[Bytes]) -> Result<Reply> {
    let scheduled = db.llen(key(keys, SCHEDULED)?)? as i64;
    let running = db.scard(key(keys, RUNNING)?)? as i64;
    let completed = counter(db, key(keys, COMPLETED)?)?;
    let canceled = counter(db, key(keys, CANCELED)?)?;
    Ok(Reply::Array(vec![
        Reply::Int(scheduled),
        Reply::Int(running),
        Reply::Int(completed),
        Reply::Int(canceled),
    ]))
}

/// ARGV: id.  `{state, payload}` or nil.
static FIND: Script = Script {
    name: "work_find",
    lua: r#"
        local state = redis.call('HGET', KEYS[4], ARGV[1])
        if not state then
            return false
        end
        local data = redis.call('HGET', KEYS[3], ARGV[1])
        if not data then
            data = ''
        end
        return {state, data}
    "#,
    local: find_local,
};

fn find_local(db: &mut Db, keys: &[String], args: &[Bytes]) -> Result<Reply> {
    let id = arg_str(args, 0)?;
    let Some(state) = state_tag(db, keys, id)? else {
        return Ok(Reply::Nil);
    };
    let data = db.hget(key(keys, DATA)?, id)?.unwrap_or_default();
    Ok(Reply::Array(vec![Reply::Data(state), Reply::Data(data)]))
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub struct WorkQueue {
    name: String,
    backend: Arc<dyn Backend>,
    keys: Vec<String>,
    notify: Notify,
    poll_jitter: RangeInclusive<Duration>,
    quiet_log_interval: Duration,
    last_outage_log: Mutex<Option<Instant>>,
    metrics: Arc<Metrics>,
}

impl WorkQueue {
    fn new(
        config: QueueConfig,
        backend: Arc<dyn Backend>,
        ns: &Namespace,
        metrics: Arc<Metrics>,
    ) -> Self {
        let keys = ["scheduled", "running", "data", "state", "completed", "canceled"]
            .iter()
            .map(|part| ns.key_part(Subsystem::Work, &config.name, part))
            .collect();
        Self {
            name: config.name,
            backend,
            keys,
            notify: Notify::new(),
            poll_jitter: config.poll_jitter,
            quiet_log_interval: config.quiet_log_interval,
            last_outage_log: Mutex::new(None),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, script: &'static Script, args: Vec<Bytes>) -> Result<Reply> {
        self.backend.eval(script, self.keys.clone(), args).await
    }

    fn check_queue(&self, item: &WorkItem) -> Result<()> {
        if item.queue != self.name {
            return Err(Error::contract(format!(
                "work {} belongs to queue {}, not {}",
                item.id, item.queue, self.name
            )));
        }
        Ok(())
    }

    fn id_and_payload(item: &WorkItem) -> Vec<Bytes> {
        vec![Bytes::from(item.id.clone()), item.payload.clone()]
    }

    // -- transitions ----------------------------------------------------------

    /// Queue `item`.  `false` when it is already scheduled or running.
    pub async fn schedule(&self, item: &WorkItem) -> Result<bool> {
        self.check_queue(item)?;
        let scheduled = self
            .run(&SCHEDULE, Self::id_and_payload(item))
            .await?
            .into_int()?
            == 1;
        if scheduled {
            self.metrics
                .work_transition(&self.name, Transition::Scheduled);
            self.notify.notify_one();
        }
        debug!(queue = %self.name, id = %item.id, scheduled, "schedule");
        Ok(scheduled)
    }

    /// Record that `item` runs, wherever it was before.
    pub async fn mark_running(&self, item: &WorkItem) -> Result<bool> {
        self.check_queue(item)?;
        let started = self
            .run(&MARK_RUNNING, Self::id_and_payload(item))
            .await?
            .into_int()?
            == 1;
        if started {
            self.metrics.work_transition(&self.name, Transition::Started);
        }
        debug!(queue = %self.name, id = %item.id, started, "mark_running");
        Ok(started)
    }

    /// `false` unless `item` was running.
    pub async fn mark_completed(&self, item: &WorkItem) -> Result<bool> {
        self.check_queue(item)?;
        let done = self
            .run(&MARK_COMPLETED, vec![Bytes::from(item.id.clone())])
            .await?
            .into_int()?
            == 1;
        if done {
            self.metrics
                .work_transition(&self.name, Transition::Completed);
        }
        debug!(queue = %self.name, id = %item.id, done, "mark_completed");
        Ok(done)
    }

    /// `false` unless `item` was scheduled or running.
    pub async fn mark_canceled(&self, item: &WorkItem) -> Result<bool> {
        self.check_queue(item)?;
        let canceled = self
            .run(&MARK_CANCELED, vec![Bytes::from(item.id.clone())])
            .await?
            .into_int()?
            == 1;
        if canceled {
            self.metrics
                .work_transition(&self.name, Transition::Canceled);
        }
        debug!(queue = %self.name, id = %item.id, canceled, "mark_canceled");
        Ok(canceled)
    }

    /// Put a running `item` back at the end of the queue.
    pub async fn reschedule(&self, item: &WorkItem) -> Result<bool> {
        self.check_queue(item)?;
        let rescheduled = self
            .run(&RESCHEDULE, Self::id_and_payload(item))
            .await?
            .into_int()?
            == 1;
        if rescheduled {
            self.metrics
                .work_transition(&self.name, Transition::Rescheduled);
            self.notify.notify_one();
        }
        debug!(queue = %self.name, id = %item.id, rescheduled, "reschedule");
        Ok(rescheduled)
    }

    // -- consumption ----------------------------------------------------------

    async fn pop(&self) -> Result<Option<WorkItem>> {
        let reply = self.run(&POP, Vec::new()).await?;
        if reply.is_nil() {
            return Ok(None);
        }
        let mut parts = reply.into_array()?.into_iter();
        let id = parts
            .next()
            .map(Reply::into_string)
            .transpose()?
            .flatten()
            .ok_or_else(|| Error::contract("pop reply has no id"))?;
        let payload = parts
            .next()
            .map(Reply::into_bytes)
            .transpose()?
            .flatten()
            .unwrap_or_default();
        self.metrics.work_transition(&self.name, Transition::Started);
        debug!(queue = %self.name, %id, "popped");
        Ok(Some(WorkItem {
            id,
            queue: self.name.clone(),
            payload,
        }))
    }

    /// Take the oldest scheduled item, marking it running, waiting at most
    /// `timeout` for one to appear.
    ///
    /// Store outages read as an empty queue: the call keeps waiting and
    /// returns `None` at the deadline.  A timeout too large to represent as
    /// a deadline waits without one.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<WorkItem>> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match self.pop().await {
                Ok(Some(item)) => return Ok(Some(item)),
                Ok(None) => {}
                Err(e) if e.is_connectivity() => self.log_outage(&e),
                Err(e) => return Err(e),
            }
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    self.jitter().min(remaining)
                }
                None => self.jitter(),
            };
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    /// Like [`WorkQueue::poll`] without a deadline.
    pub async fn take(&self) -> Result<WorkItem> {
        loop {
            if let Some(item) = self.poll(TAKE_SLICE).await? {
                return Ok(item);
            }
        }
    }

    fn jitter(&self) -> Duration {
        let (min, max) = (*self.poll_jitter.start(), *self.poll_jitter.end());
        if min >= max {
            return min;
        }
        let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(millis)
    }

    fn log_outage(&self, e: &Error) {
        self.metrics.store_errors.inc();
        let now = Instant::now();
        let mut last = self.last_outage_log.lock();
        let due = last.map_or(true, |at| now.duration_since(at) >= self.quiet_log_interval);
        if due {
            *last = Some(now);
            warn!(queue = %self.name, error = %e, "store unreachable, queue treated as empty");
        }
    }

    // -- inspection -----------------------------------------------------------

    /// Ids in `state`, oldest first for scheduled work.  Completed and
    /// canceled items are not retained, so those lists are always empty.
    pub async fn list_ids(&self, state: WorkState) -> Result<Vec<String>> {
        match state {
            WorkState::Scheduled => {
                let raw = self.backend.lrange(&self.keys[SCHEDULED], 0, -1).await?;
                raw.into_iter()
                    .rev()
                    .map(|id| {
                        String::from_utf8(id.to_vec())
                            .map_err(|_| Error::contract("scheduled id is not valid UTF-8"))
                    })
                    .collect()
            }
            WorkState::Running => {
                let mut ids = self.backend.smembers(&self.keys[RUNNING]).await?;
                ids.sort();
                Ok(ids)
            }
            WorkState::Completed | WorkState::Canceled => Ok(Vec::new()),
        }
    }

    pub async fn metrics(&self) -> Result<QueueMetrics> {
        let counts = self
            .run(&METRICS, Vec::new())
            .await?
            .into_array()?
            .into_iter()
            .map(|r| r.into_int().map(|n| n.max(0) as u64))
            .collect::<Result<Vec<_>>>()?;
        match counts.as_slice() {
            [scheduled, running, completed, canceled] => Ok(QueueMetrics {
                scheduled: *scheduled,
                running: *running,
                completed: *completed,
                canceled: *canceled,
            }),
            _ => Err(Error::contract("queue metrics reply has the wrong shape")),
        }
    }

    /// The scheduled or running item with this id.
    pub async fn find(&self, id: &str) -> Result<Option<(WorkState, WorkItem)>> {
        let reply = self
            .run(&FIND, vec![Bytes::copy_from_slice(id.as_bytes())])
            .await?;
        if reply.is_nil() {
            return Ok(None);
        }
        let mut parts = reply.into_array()?.into_iter();
        let state = parts
            .next()
            .map(Reply::into_bytes)
            .transpose()?
            .flatten()
            .ok_or_else(|| Error::contract("find reply has no state"))?;
        let payload = parts
            .next()
            .map(Reply::into_bytes)
            .transpose()?
            .flatten()
            .unwrap_or_default();
        Ok(Some((
            WorkState::from_tag(&state)?,
            WorkItem {
                id: id.to_string(),
                queue: self.name.clone(),
                payload,
            },
        )))
    }

    /// `None` once the item has completed, been canceled, or never existed.
    pub async fn state_of(&self, id: &str) -> Result<Option<WorkState>> {
        match self.backend.hget(&self.keys[STATE], id).await? {
            Some(tag) => WorkState::from_tag(&tag).map(Some),
            None => Ok(None),
        }
    }

    /// Drop every item and reset the counters.
    pub async fn clear(&self) -> Result<()> {
        let removed = self.backend.del(&self.keys).await?;
        info!(queue = %self.name, removed, "queue cleared");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The queues open in this process.
pub struct WorkQueues {
    backend: Arc<dyn Backend>,
    ns: Namespace,
    metrics: Arc<Metrics>,
    queues: RwLock<HashMap<String, Arc<WorkQueue>>>,
}

impl WorkQueues {
    pub fn new(backend: Arc<dyn Backend>, ns: Namespace, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            ns,
            metrics,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Open the queue, or return the already open one with that name.
    pub fn init(&self, config: QueueConfig) -> Result<Arc<WorkQueue>> {
        if config.name.is_empty() || config.name.contains(':') {
            return Err(Error::contract(format!(
                "queue name {:?} must be non-empty and must not contain ':'",
                config.name
            )));
        }
        if let Some(queue) = self.queues.read().get(&config.name) {
            return Ok(Arc::clone(queue));
        }
        let mut queues = self.queues.write();
        let queue = queues.entry(config.name.clone()).or_insert_with(|| {
            info!(queue = %config.name, "work queue opened");
            Arc::new(WorkQueue::new(
                config,
                Arc::clone(&self.backend),
                &self.ns,
                Arc::clone(&self.metrics),
            ))
        });
        Ok(Arc::clone(queue))
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkQueue>> {
        self.queues.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::store::memory::MemoryBackend;

    fn queues(store: &MemoryBackend) -> WorkQueues {
        WorkQueues::new(
            Arc::new(store.clone()),
            Namespace::new("t:"),
            MetricsRegistry::new().metrics,
        )
    }

    fn fast(name: &str) -> QueueConfig {
        QueueConfig {
            name: name.to_string(),
            poll_jitter: Duration::from_millis(5)..=Duration::from_millis(10),
            quiet_log_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn state_tags() {
        for state in [
            WorkState::Scheduled,
            WorkState::Running,
            WorkState::Completed,
            WorkState::Canceled,
        ] {
            assert_eq!(WorkState::from_tag(state.tag().as_bytes()).unwrap(), state);
        }
        assert!(WorkState::from_tag(b"?").is_err());
    }

    #[tokio::test]
    async fn init_is_idempotent_and_validates_names() {
        let store = MemoryBackend::new();
        let registry = queues(&store);
        let a = registry.init(fast("q1")).unwrap();
        let b = registry.init(fast("q1")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("q1").is_some());
        assert!(registry.get("q2").is_none());
        assert!(registry.init(fast("bad:name")).is_err());
    }

    #[tokio::test]
    async fn fifo_order() {
        let store = MemoryBackend::new();
        let q = queues(&store).init(fast("q1")).unwrap();
        for id in ["a", "b", "c"] {
            assert!(q.schedule(&WorkItem::new("q1", id, "p")).await.unwrap());
        }
        assert_eq!(q.list_ids(WorkState::Scheduled).await.unwrap(), vec!["a", "b", "c"]);
        let first = q.poll(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(first.payload, Bytes::from_static(b"p"));
        assert_eq!(q.list_ids(WorkState::Running).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn duplicate_schedule_is_refused() {
        let store = MemoryBackend::new();
        let q = queues(&store).init(fast("q1")).unwrap();
        let item = WorkItem::new("q1", "w", "p");
        assert!(q.schedule(&item).await.unwrap());
        assert!(!q.schedule(&item).await.unwrap());
        assert_eq!(q.metrics().await.unwrap().scheduled, 1);
        assert!(q.schedule(&WorkItem::new("other", "w", "p")).await.is_err());
    }

    #[tokio::test]
    async fn transitions_keep_counts() {
        let store = MemoryBackend::new();
        let q = queues(&store).init(fast("q1")).unwrap();
        let a = WorkItem::new("q1", "a", "1");
        let b = WorkItem::new("q1", "b", "2");
        q.schedule(&a).await.unwrap();
        q.schedule(&b).await.unwrap();

        // Only running work completes.
        assert!(!q.mark_completed(&a).await.unwrap());
        assert!(q.mark_running(&a).await.unwrap());
        assert_eq!(q.state_of("a").await.unwrap(), Some(WorkState::Running));
        assert!(q.mark_canceled(&b).await.unwrap());
        assert!(!q.mark_canceled(&b).await.unwrap());
        assert!(q.mark_completed(&a).await.unwrap());

        assert_eq!(
            q.metrics().await.unwrap(),
            QueueMetrics {
                scheduled: 0,
                running: 0,
                completed: 1,
                canceled: 1,
            }
        );
        assert_eq!(q.state_of("a").await.unwrap(), None);
        assert!(q.find("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reschedule_moves_running_back() {
        let store = MemoryBackend::new();
        let q = queues(&store).init(fast("q1")).unwrap();
        q.schedule(&WorkItem::new("q1", "a", "v1")).await.unwrap();
        let item = q.poll(Duration::ZERO).await.unwrap().unwrap();
        assert!(q
            .reschedule(&WorkItem::new("q1", &item.id, "v2"))
            .await
            .unwrap());
        let (state, found) = q.find("a").await.unwrap().unwrap();
        assert_eq!(state, WorkState::Scheduled);
        assert_eq!(found.payload, Bytes::from_static(b"v2"));
        assert!(!q.reschedule(&found).await.unwrap());
    }

    #[tokio::test]
    async fn local_schedule_wakes_a_waiting_poller() {
        let store = MemoryBackend::new();
        let registry = queues(&store);
        let q = registry
            .init(QueueConfig {
                name: "q1".into(),
                poll_jitter: Duration::from_secs(30)..=Duration::from_secs(30),
                quiet_log_interval: Duration::from_secs(60),
            })
            .unwrap();
        let poller = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.poll(Duration::from_secs(20)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        q.schedule(&WorkItem::new("q1", "a", "p")).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), poller)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().id, "a");
    }

    #[tokio::test]
    async fn unbounded_timeout_returns_queued_work() {
        let store = MemoryBackend::new();
        let q = queues(&store).init(fast("q1")).unwrap();
        q.schedule(&WorkItem::new("q1", "a", "p")).await.unwrap();
        let item = q.poll(Duration::MAX).await.unwrap().unwrap();
        assert_eq!(item.id, "a");
    }

    #[tokio::test]
    async fn unbounded_timeout_waits_for_late_work() {
        let store = MemoryBackend::new();
        let q = queues(&store).init(fast("q1")).unwrap();
        let poller = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.poll(Duration::MAX).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        q.schedule(&WorkItem::new("q1", "late", "p")).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), poller)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().id, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn outage_reads_as_empty() {
        let store = MemoryBackend::new();
        let q = queues(&store).init(fast("q1")).unwrap();
        store.set_outage(true);
        assert_eq!(q.poll(Duration::from_millis(100)).await.unwrap(), None);
        store.set_outage(false);
        q.schedule(&WorkItem::new("q1", "a", "p")).await.unwrap();
        assert!(q.poll(Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let store = MemoryBackend::new();
        let q = queues(&store).init(fast("q1")).unwrap();
        q.schedule(&WorkItem::new("q1", "a", "p")).await.unwrap();
        q.clear().await.unwrap();
        assert_eq!(q.metrics().await.unwrap(), QueueMetrics::default());
    }
}
