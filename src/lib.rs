//! Cluster coordination over a shared Redis-compatible store.
//!
//! Every node of a cluster runs one [`Coordinator`] against the same store
//! and namespace.  Through it the nodes share work queues with exactly-once
//! hand-off, named locks, a key-value store with compare-and-set, cache
//! invalidation broadcasts, size-bounded transient storage and a pub/sub
//! channel.  Per-component types are available from their modules for
//! callers that do not want the façade.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod invalidation;
pub mod kv;
pub mod lock;
pub mod metrics;
pub mod namespace;
pub mod node;
pub mod pubsub;
pub mod store;
pub mod transient;
pub mod work;

pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use invalidation::Invalidations;
pub use pubsub::{ClusterMessage, MessageHandler};
pub use work::{WorkItem, WorkState};
