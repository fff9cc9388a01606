//! Two sync nodes over loopback TCP.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tasksync_core::sync::{Outbox, TcpTransport, Transport};
use tasksync_core::{
    Clock, ConnectionState, NodeIdentity, PeerAddr, SyncConfig, SyncOrchestrator, SystemClock,
    Task, TaskState, TaskStore,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn build_node(name: &str, dir: &TempDir, peers: Vec<PeerAddr>) -> SyncOrchestrator {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let identity = NodeIdentity::new(name).unwrap();
    let store = TaskStore::open(&dir.path().join(format!("{name}.db")), &identity, clock.clone())
        .unwrap();
    let outbox = Outbox::load(dir.path().join(format!("{name}-outbox.json"))).unwrap();
    let transport: Arc<dyn Transport> =
        Arc::new(TcpTransport::new(SocketAddr::from(([127, 0, 0, 1], 0))));
    let config = SyncConfig {
        peers,
        reconnect_interval_secs: 1,
        ..SyncConfig::default()
    };
    SyncOrchestrator::new(identity, config, store, transport, outbox, clock)
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_nodes_converge_over_tcp() {
    let dir = TempDir::new().unwrap();

    let a = build_node("node-a", &dir, Vec::new());
    let cancel = CancellationToken::new();
    let addr = a.start(cancel.clone()).await.unwrap();

    // A has history before B ever connects.
    let early = a.add_task(Task::new("written on a").with_user("alice")).await.unwrap();

    // B queues a change while offline.
    let b = build_node("node-b", &dir, vec![PeerAddr::new("127.0.0.1", addr.port())]);
    let offline = b.add_task(Task::new("written offline on b")).await.unwrap();
    assert_eq!(b.pending_count().await, 1);

    b.start(cancel.clone()).await.unwrap();

    wait_until("anti-entropy to deliver a's task to b", || {
        let b = b.clone();
        let id = early.id.clone();
        async move { b.get_task(&id).await.unwrap().is_some() }
    })
    .await;
    wait_until("b's outbox to reach a", || {
        let a = a.clone();
        let id = offline.id.clone();
        async move { a.get_task(&id).await.unwrap().is_some() }
    })
    .await;
    assert_eq!(b.pending_count().await, 0);
    assert_eq!(b.connection_state().await, ConnectionState::Connected);

    // Live edits flow in both directions.
    b.mark_done(&early.id).await.unwrap();
    wait_until("completion to reach a", || {
        let a = a.clone();
        let id = early.id.clone();
        async move {
            a.get_task(&id)
                .await
                .unwrap()
                .is_some_and(|t| t.state == TaskState::Done)
        }
    })
    .await;

    a.delete_task(&offline.id).await.unwrap();
    wait_until("deletion to reach b", || {
        let b = b.clone();
        let id = offline.id.clone();
        async move { b.get_task(&id).await.unwrap().is_none() }
    })
    .await;
    assert!(b.tombstone(&offline.id).await.unwrap().is_some());

    let on_a = a.get_task(&early.id).await.unwrap().unwrap();
    let on_b = b.get_task(&early.id).await.unwrap().unwrap();
    assert_eq!(on_a, on_b);
    assert_eq!(on_a.event_version, 2);
    assert_eq!(on_a.device_id, "node-a");

    cancel.cancel();
    a.shutdown().await;
    b.shutdown().await;
    assert_eq!(a.status().await.connection, ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outbox_survives_restart_and_drains_to_peer() {
    let dir = TempDir::new().unwrap();

    let ids: Vec<String> = {
        let node = build_node("node-b", &dir, Vec::new());
        let one = node.add_task(Task::new("one")).await.unwrap();
        let two = node.add_task(Task::new("two")).await.unwrap();
        assert_eq!(node.pending_count().await, 2);
        vec![one.id, two.id]
    };

    let a = build_node("node-a", &dir, Vec::new());
    let cancel = CancellationToken::new();
    let addr = a.start(cancel.clone()).await.unwrap();

    let restarted = build_node("node-b", &dir, vec![PeerAddr::new("127.0.0.1", addr.port())]);
    assert_eq!(restarted.pending_count().await, 2);
    assert_eq!(restarted.get_tasks(None, None).await.unwrap().len(), 2);

    restarted.start(cancel.clone()).await.unwrap();
    wait_until("queued tasks to reach a after restart", || {
        let a = a.clone();
        let ids = ids.clone();
        async move {
            for id in &ids {
                if a.get_task(id).await.unwrap().is_none() {
                    return false;
                }
            }
            true
        }
    })
    .await;
    wait_until("restarted outbox to drain", || {
        let restarted = restarted.clone();
        async move { restarted.pending_count().await == 0 }
    })
    .await;

    cancel.cancel();
    a.shutdown().await;
    restarted.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_writes_complete_while_peer_stops_reading() {
    let dir = TempDir::new().unwrap();

    // Accepts, then never reads.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled_addr = listener.local_addr().unwrap();
    let stalled = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let transport = TcpTransport::new(SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_send_timeout(Duration::from_millis(200));
    transport.connect_to_peer("127.0.0.1", stalled_addr.port()).await.unwrap();
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let identity = NodeIdentity::new("node-a").unwrap();
    let store = TaskStore::open(&dir.path().join("node-a.db"), &identity, clock.clone()).unwrap();
    let outbox = Outbox::load(dir.path().join("node-a-outbox.json")).unwrap();
    let node = SyncOrchestrator::new(identity, SyncConfig::default(), store, transport, outbox, clock);

    // Once the socket buffers fill, the peer is dropped and writes queue.
    let mut written = 0;
    while node.pending_count().await == 0 {
        assert!(written < 64, "stalled peer was never dropped");
        let mut task = Task::new(format!("bulky {written}"));
        task.description = Some("x".repeat(1 << 20));
        tokio::time::timeout(Duration::from_secs(3), node.add_task(task))
            .await
            .unwrap_or_else(|_| panic!("add_task #{written} hung on a stalled peer"))
            .unwrap();
        written += 1;
    }

    assert_eq!(node.get_tasks(None, None).await.unwrap().len(), written);
    assert_eq!(node.connection_state().await, ConnectionState::Disconnected);
    stalled.abort();
}
