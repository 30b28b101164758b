use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    /// Deployment prefix for every key and channel (e.g. `myapp:`).
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub work: WorkConfig,
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    /// Transient stores by name.
    #[serde(default)]
    pub transient: HashMap<String, TransientStoreConfig>,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            namespace: default_namespace(),
            node: NodeConfig::default(),
            pubsub: PubSubConfig::default(),
            work: WorkConfig::default(),
            invalidation: InvalidationConfig::default(),
            transient: HashMap::new(),
            http: HttpConfig::default(),
        }
    }
}

fn default_namespace() -> String {
    "clustercoord:".to_string()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis / KeyDB over a `fred` pool.
    #[default]
    Redis,
    /// In-process store; single node only.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// `host:port`, optionally with a `redis://` / `rediss://` scheme.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the store password.
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How many times a command is attempted across reconnects before the
    /// caller sees a connection error.
    #[serde(default = "default_max_command_attempts")]
    pub max_command_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoint: default_endpoint(),
            tls: false,
            auth_token_env: default_auth_token_env(),
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_command_attempts: default_max_command_attempts(),
        }
    }
}

fn default_endpoint() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_auth_token_env() -> String {
    "CLUSTERCOORD_STORE_PASSWORD".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_command_attempts() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    /// Explicit node id.  Derived from the environment and hostname when
    /// unset.  Must not contain `:`.
    pub id: Option<String>,
}

// ---------------------------------------------------------------------------
// Pub/sub dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PubSubConfig {
    /// Worker tasks delivering messages to handlers.
    #[serde(default = "default_pubsub_workers")]
    pub workers: usize,
    /// How long startup waits for the subscription acknowledgement.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Per-worker queue depth between the subscriber and the worker.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl PubSubConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            workers: default_pubsub_workers(),
            startup_timeout_ms: default_startup_timeout_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_pubsub_workers() -> usize {
    4
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}

fn default_channel_capacity() -> usize {
    256
}

// ---------------------------------------------------------------------------
// Work queues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WorkConfig {
    /// Lower bound of the randomised wait between remote polls.
    #[serde(default = "default_poll_jitter_min_ms")]
    pub poll_jitter_min_ms: u64,
    /// Upper bound of the randomised wait between remote polls.
    #[serde(default = "default_poll_jitter_max_ms")]
    pub poll_jitter_max_ms: u64,
    /// Minimum spacing between two "store unreachable" log lines per queue.
    #[serde(default = "default_quiet_log_interval_secs")]
    pub quiet_log_interval_secs: u64,
    /// Queues opened at startup.
    #[serde(default)]
    pub queues: Vec<String>,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            poll_jitter_min_ms: default_poll_jitter_min_ms(),
            poll_jitter_max_ms: default_poll_jitter_max_ms(),
            quiet_log_interval_secs: default_quiet_log_interval_secs(),
            queues: Vec::new(),
        }
    }
}

fn default_poll_jitter_min_ms() -> u64 {
    500
}

fn default_poll_jitter_max_ms() -> u64 {
    1_500
}

fn default_quiet_log_interval_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Invalidation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct InvalidationConfig {
    /// Scopes (e.g. repository names) initialised at startup.
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// A node whose last heartbeat is older than this is considered gone.
    #[serde(default = "default_node_ttl_secs")]
    pub node_ttl_secs: u64,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            scopes: Vec::new(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            node_ttl_secs: default_node_ttl_secs(),
        }
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

fn default_node_ttl_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Transient stores
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TransientStoreConfig {
    /// TTL (seconds) while an entry is being written or read.
    #[serde(default = "default_first_level_ttl_secs")]
    pub first_level_ttl_secs: u64,
    /// TTL (seconds) after an entry has been released.
    #[serde(default = "default_second_level_ttl_secs")]
    pub second_level_ttl_secs: u64,
    /// Storage budget in bytes across all entries of the store.
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
}

impl Default for TransientStoreConfig {
    fn default() -> Self {
        Self {
            first_level_ttl_secs: default_first_level_ttl_secs(),
            second_level_ttl_secs: default_second_level_ttl_secs(),
            max_size_bytes: default_max_size_bytes(),
        }
    }
}

fn default_first_level_ttl_secs() -> u64 {
    10 * 60
}

fn default_second_level_ttl_secs() -> u64 {
    2 * 3600
}

fn default_max_size_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Socket address for `/healthz` and `/metrics`.
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:9464".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.namespace.is_empty() && config.namespace.ends_with(':'),
        "namespace must be non-empty and end with ':'"
    );
    anyhow::ensure!(
        config.work.poll_jitter_min_ms <= config.work.poll_jitter_max_ms,
        "poll_jitter_min_ms must not exceed poll_jitter_max_ms"
    );
    anyhow::ensure!(config.pubsub.workers > 0, "pubsub.workers must be > 0");
    anyhow::ensure!(config.store.pool_size > 0, "store.pool_size must be > 0");
    anyhow::ensure!(
        config.invalidation.heartbeat_interval_secs > 0,
        "invalidation.heartbeat_interval_secs must be > 0"
    );
    anyhow::ensure!(
        config.invalidation.node_ttl_secs > config.invalidation.heartbeat_interval_secs,
        "invalidation.node_ttl_secs must exceed heartbeat_interval_secs"
    );
    if let Some(id) = &config.node.id {
        crate::node::check_node_id(id).context("invalid node.id")?;
    }
    for (name, store) in &config.transient {
        anyhow::ensure!(
            store.first_level_ttl_secs > 0
                && store.first_level_ttl_secs <= store.second_level_ttl_secs,
            "transient store {name}: first_level_ttl_secs must be > 0 and not exceed second_level_ttl_secs"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_uses_defaults() {
        let file = write_config("{}\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.namespace, "clustercoord:");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.pubsub.workers, 4);
        assert!(config.transient.is_empty());
    }

    #[test]
    fn full_file_parses() {
        let file = write_config(
            r#"
store:
  backend: memory
  endpoint: "rediss://keydb.local:6380"
  pool_size: 8
namespace: "acme:"
node:
  id: node-a
work:
  poll_jitter_min_ms: 100
  poll_jitter_max_ms: 200
  queues: [default, images]
invalidation:
  scopes: [default]
transient:
  uploads:
    first_level_ttl_secs: 60
    second_level_ttl_secs: 600
    max_size_bytes: 1024
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.pool_size, 8);
        assert_eq!(config.node.id.as_deref(), Some("node-a"));
        assert_eq!(config.work.queues, vec!["default", "images"]);
        assert_eq!(config.transient["uploads"].max_size_bytes, 1024);
    }

    #[test]
    fn rejects_namespace_without_delimiter() {
        let file = write_config("namespace: acme\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn rejects_inverted_jitter_window() {
        let file = write_config("work:\n  poll_jitter_min_ms: 10\n  poll_jitter_max_ms: 5\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn rejects_inverted_transient_ttls() {
        let file = write_config(
            "transient:\n  t:\n    first_level_ttl_secs: 600\n    second_level_ttl_secs: 60\n",
        );
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn node_ttl_must_outlive_heartbeat() {
        let file = write_config("invalidation:\n  node_ttl_secs: 0\n");
        assert!(load_config(file.path()).is_err());

        let file = write_config(
            "invalidation:\n  heartbeat_interval_secs: 30\n  node_ttl_secs: 30\n",
        );
        assert!(load_config(file.path()).is_err());

        let file = write_config(
            "invalidation:\n  heartbeat_interval_secs: 10\n  node_ttl_secs: 31\n",
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.invalidation.node_ttl_secs, 31);
    }

    #[test]
    fn rejects_node_id_with_delimiter() {
        let file = write_config("node:\n  id: \"a:b\"\n");
        assert!(load_config(file.path()).is_err());
    }
}
