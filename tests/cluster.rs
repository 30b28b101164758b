//! Several nodes sharing one in-process store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use clustercoord::config::{Config, StoreBackend, TransientStoreConfig};
use clustercoord::store::memory::MemoryBackend;
use clustercoord::transient::{BlobDescriptor, Released};
use clustercoord::work::QueueMetrics;
use clustercoord::{ClusterMessage, Coordinator, Invalidations, WorkItem, WorkState};

fn node_config(node: &str) -> Config {
    let mut config = Config::default();
    config.store.backend = StoreBackend::Memory;
    config.namespace = "it:".into();
    config.node.id = Some(node.into());
    config.work.poll_jitter_min_ms = 5;
    config.work.poll_jitter_max_ms = 10;
    config.work.queues = vec!["q1".into()];
    config.invalidation.scopes = vec!["repo".into()];
    config.transient.insert(
        "uploads".into(),
        TransientStoreConfig {
            first_level_ttl_secs: 60,
            second_level_ttl_secs: 600,
            max_size_bytes: 100,
        },
    );
    config
}

async fn cluster(nodes: &[&str]) -> Vec<Arc<Coordinator>> {
    let store = MemoryBackend::new();
    let mut started = Vec::with_capacity(nodes.len());
    for node in nodes {
        let coordinator = Coordinator::with_backend(node_config(node), Arc::new(store.clone()))
            .await
            .unwrap();
        started.push(Arc::new(coordinator));
    }
    started
}

async fn shutdown(nodes: Vec<Arc<Coordinator>>) {
    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_item_is_taken_by_exactly_one_poller() {
    let nodes = cluster(&["a", "b", "c"]).await;
    for i in 0..30 {
        assert!(nodes[0]
            .schedule_work("q1", &format!("w{i}"), Bytes::from(format!("p{i}")))
            .await
            .unwrap());
    }

    let taken = Arc::new(Mutex::new(Vec::new()));
    let mut pollers = Vec::new();
    for node in &nodes {
        for _ in 0..2 {
            let queue = node.queue("q1").unwrap();
            let taken = Arc::clone(&taken);
            pollers.push(tokio::spawn(async move {
                while let Some(item) = queue.poll(Duration::from_millis(100)).await.unwrap() {
                    taken.lock().push(item.id);
                }
            }));
        }
    }
    for poller in pollers {
        poller.await.unwrap();
    }

    let taken = taken.lock().clone();
    let unique: HashSet<&String> = taken.iter().collect();
    assert_eq!(taken.len(), 30);
    assert_eq!(unique.len(), 30);
    assert_eq!(nodes[1].queue("q1").unwrap().metrics().await.unwrap().running, 30);
    shutdown(nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_compare_and_set_wins() {
    let nodes = cluster(&["a", "b", "c", "d"]).await;
    let mut racers = Vec::new();
    for node in &nodes {
        let node = Arc::clone(node);
        racers.push(tokio::spawn(async move {
            let mine = node.node_id().to_string();
            node.kv_compare_and_set("leader", None, Some(mine.as_bytes()), 0)
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for racer in racers {
        if racer.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    let leader = nodes[0].kv_get("leader").await.unwrap().unwrap();
    assert!(["a", "b", "c", "d"].contains(&std::str::from_utf8(&leader).unwrap()));
    shutdown(nodes).await;
}

#[tokio::test]
async fn lock_release_is_announced() {
    let nodes = cluster(&["a", "b"]).await;
    let released = Arc::new(Mutex::new(Vec::new()));
    {
        let released = Arc::clone(&released);
        nodes[1].subscribe(
            &clustercoord::lock::release_topic("doc"),
            Arc::new(move |message: &ClusterMessage| {
                if let ClusterMessage::LockReleased { resource, owner } = message {
                    released.lock().push((resource.clone(), owner.clone()));
                }
            }),
        );
    }

    assert!(nodes[0].acquire_lock("doc", "writer-a").await.unwrap());
    assert!(!nodes[1].acquire_lock("doc", "writer-b").await.unwrap());
    assert!(!nodes[1].release_lock("doc", "writer-b").await.unwrap());
    assert!(nodes[0].release_lock("doc", "writer-a").await.unwrap());

    tokio::time::timeout(Duration::from_secs(5), async {
        while released.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        released.lock()[0],
        ("doc".to_string(), "writer-a".to_string())
    );
    assert!(nodes[1].acquire_lock("doc", "writer-b").await.unwrap());
    shutdown(nodes).await;
}

#[tokio::test]
async fn invalidations_reach_other_nodes_only() {
    let nodes = cluster(&["a", "b"]).await;
    nodes[0]
        .invalidate("repo", &Invalidations::of(["x", "y"]))
        .await
        .unwrap();

    let b = nodes[1].invalidation("repo").unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let batch = b.receive_invalidations();
            if !batch.is_empty() {
                return batch;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(received, Invalidations::of(["x", "y"]));

    // Nothing echoes back to the sender.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(nodes[0]
        .invalidation("repo")
        .unwrap()
        .receive_invalidations()
        .is_empty());

    let active = b.active_nodes().await.unwrap();
    assert_eq!(active, vec!["a".to_string(), "b".to_string()]);
    shutdown(nodes).await;
}

#[tokio::test]
async fn transient_size_follows_the_latest_persist() {
    let nodes = cluster(&["a", "b"]).await;
    let a = nodes[0].transient("uploads").unwrap();
    let b = nodes[1].transient("uploads").unwrap();

    a.persist_blobs("doc", 100, &[BlobDescriptor::new("blob-1", 100)])
        .await
        .unwrap();
    b.persist_blobs("doc", 50, &[BlobDescriptor::new("blob-2", 50)])
        .await
        .unwrap();
    assert_eq!(a.storage_size().await.unwrap(), 50);
    assert_eq!(a.get_blobs("doc").await.unwrap()[0].locator, "blob-2");

    assert_eq!(b.release("doc").await.unwrap(), Released::Retained);
    assert!(a.exists("doc").await.unwrap());

    b.persist_blobs("big", 120, &[BlobDescriptor::new("blob-3", 120)])
        .await
        .unwrap();
    assert_eq!(a.release("big").await.unwrap(), Released::Evicted);
    assert!(!b.exists("big").await.unwrap());
    assert_eq!(b.storage_size().await.unwrap(), 50);
    shutdown(nodes).await;
}

#[tokio::test]
async fn queue_lifecycle_end_to_end() {
    let nodes = cluster(&["a"]).await;
    let q1 = nodes[0].queue("q1").unwrap();
    assert_eq!(q1.metrics().await.unwrap(), QueueMetrics::default());

    let item1 = WorkItem::new("q1", "item1", "payload");
    assert!(q1.schedule(&item1).await.unwrap());
    assert_eq!(
        q1.metrics().await.unwrap(),
        QueueMetrics {
            scheduled: 1,
            ..QueueMetrics::default()
        }
    );

    let polled = q1.poll(Duration::from_secs(5)).await.unwrap().unwrap();
    assert_eq!(polled, item1);
    assert_eq!(
        q1.metrics().await.unwrap(),
        QueueMetrics {
            running: 1,
            ..QueueMetrics::default()
        }
    );
    assert_eq!(q1.state_of("item1").await.unwrap(), Some(WorkState::Running));

    assert!(q1.mark_completed(&polled).await.unwrap());
    assert_eq!(
        q1.metrics().await.unwrap(),
        QueueMetrics {
            completed: 1,
            ..QueueMetrics::default()
        }
    );
    assert!(q1.find("item1").await.unwrap().is_none());
    shutdown(nodes).await;
}

#[tokio::test]
async fn node_without_subscription_still_coordinates() {
    let store = MemoryBackend::new();
    store.stall_subscriptions(true);
    let mut config = node_config("lonely");
    config.pubsub.startup_timeout_ms = 100;
    let coordinator = Coordinator::with_backend(config, Arc::new(store.clone()))
        .await
        .unwrap();

    assert!(!coordinator.pubsub().is_subscribed());
    assert!(coordinator.acquire_lock("doc", "writer").await.unwrap());
    assert!(coordinator
        .schedule_work("q1", "w", Bytes::from_static(b"p"))
        .await
        .unwrap());
    coordinator
        .invalidate("repo", &Invalidations::all())
        .await
        .unwrap();
    coordinator.shutdown().await;
}
