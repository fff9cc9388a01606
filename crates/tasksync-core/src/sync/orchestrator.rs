//! Sync orchestrator.
//!
//! Owns the node identity, the store, the transport, the pending outbox and
//! the connection state. Local mutations go through the facade methods and are
//! published; inbound events are applied with [`ChangeOrigin::Remote`] and are
//! never published again.
//!
//! SQLite work and outbox file writes run on the blocking thread pool, so the
//! async workers never wait on disk. The store and outbox locks are never held
//! across a network call. Local mutations hold an ordering lock from commit
//! until their event is sent or queued, so peers see them in commit order.

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, MutexGuard};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, StoreError};
use crate::storage::{PeerAddr, SyncConfig, TaskStore};
use crate::sync::dedup::DedupWindow;
use crate::sync::device_id::NodeIdentity;
use crate::sync::event::SyncEvent;
use crate::sync::manifest::ManifestEntry;
use crate::sync::outbox::{Outbox, PendingEvent};
use crate::sync::transport::{TcpTransport, Transport};
use crate::sync::types::{ConnectionState, SyncError, SyncStatus};
use crate::task::Task;

const CHANGE_FEED_CAPACITY: usize = 256;

/// Where a committed change came from.
///
/// Passed explicitly to the code that commits a change; only `Local`
/// changes are published to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote { device_id: String },
}

impl ChangeOrigin {
    pub fn is_local(&self) -> bool {
        matches!(self, ChangeOrigin::Local)
    }
}

/// A change accepted into the local store.
#[derive(Debug, Clone)]
pub struct AppliedChange {
    pub event: SyncEvent,
    pub origin: ChangeOrigin,
}

struct Shared {
    identity: NodeIdentity,
    config: SyncConfig,
    store: Arc<std::sync::Mutex<TaskStore>>,
    transport: Arc<dyn Transport>,
    outbox: Arc<std::sync::Mutex<Outbox>>,
    state: Mutex<ConnectionState>,
    dedup: Mutex<DedupWindow>,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    flush_lock: Mutex<()>,
    local_order: Mutex<()>,
    clock: Arc<dyn Clock>,
    changes: broadcast::Sender<AppliedChange>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Peer-to-peer sync node. Cheap to clone.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Shared>,
}

impl SyncOrchestrator {
    pub fn new(
        identity: NodeIdentity,
        config: SyncConfig,
        store: TaskStore,
        transport: Arc<dyn Transport>,
        outbox: Outbox,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let dedup = DedupWindow::new(config.dedup_window());
        Self {
            inner: Arc::new(Shared {
                identity,
                config,
                store: Arc::new(std::sync::Mutex::new(store)),
                transport,
                outbox: Arc::new(std::sync::Mutex::new(outbox)),
                state: Mutex::new(ConnectionState::Disconnected),
                dedup: Mutex::new(dedup),
                last_sync_at: Mutex::new(None),
                flush_lock: Mutex::new(()),
                local_order: Mutex::new(()),
                clock,
                changes,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open a node rooted at `dir`: identity, SQLite store and outbox file
    /// all live there, and the transport binds `0.0.0.0:<listen_port>`.
    pub fn open(dir: &Path, config: SyncConfig) -> Result<Self, CoreError> {
        let identity = NodeIdentity::load_or_create(dir)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = TaskStore::open(&dir.join("tasksync.db"), &identity, clock.clone())?;
        let outbox = Outbox::load(dir.join(&config.outbox_file))?;
        let bind = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
        let transport: Arc<dyn Transport> =
            Arc::new(TcpTransport::new(bind).with_send_timeout(config.send_timeout()));
        Ok(Self::new(identity, config, store, transport, outbox, clock))
    }

    pub fn device_id(&self) -> &str {
        self.inner.identity.device_id()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Receive every change accepted into the store, local or remote.
    pub fn subscribe(&self) -> broadcast::Receiver<AppliedChange> {
        self.inner.changes.subscribe()
    }

    // === Lifecycle ===

    /// Start listening and spawn the inbound pump and the reconnect loop.
    ///
    /// Cancelling `cancel` (or calling [`Self::shutdown`]) stops both.
    pub async fn start(&self, cancel: CancellationToken) -> Result<SocketAddr, SyncError> {
        let addr = self.inner.transport.start_listening().await?;
        let mut inbound = self
            .inner
            .transport
            .take_inbound()
            .await
            .ok_or_else(|| SyncError::Transport("inbound channel already taken".into()))?;
        tracing::info!(device_id = %self.device_id(), addr = %addr, "sync node listening");

        let shutdown = self.inner.shutdown.clone();
        let link = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => shutdown.cancel(),
                    _ = shutdown.cancelled() => {}
                }
            }
        });

        let pump = tokio::spawn({
            let this = self.clone();
            let shutdown = shutdown.clone();
            async move {
                loop {
                    let event = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = inbound.recv() => event,
                    };
                    let Some(event) = event else { break };
                    let this = this.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_inbound(event).await {
                            tracing::warn!(error = %e, "failed to handle inbound event");
                        }
                    });
                }
            }
        });

        let reconnect = tokio::spawn({
            let this = self.clone();
            async move {
                let mut ticker = tokio::time::interval(this.inner.config.reconnect_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => this.reconnect_once().await,
                    }
                }
            }
        });

        self.inner.tasks.lock().await.extend([link, pump, reconnect]);
        Ok(addr)
    }

    /// Stop background tasks and close every peer stream.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.transport.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.set_state(ConnectionState::Disconnected).await;
        tracing::info!(device_id = %self.device_id(), "sync node stopped");
    }

    /// Dial every configured peer that is not currently connected.
    pub async fn reconnect_once(&self) {
        let peers: &[PeerAddr] = &self.inner.config.peers;
        let mut dialed = false;

        for peer in peers {
            if self.inner.transport.is_connected_to(&peer.host, peer.port).await {
                continue;
            }
            if self.connection_state().await == ConnectionState::Disconnected {
                self.set_state(ConnectionState::Connecting).await;
            }
            match self.inner.transport.connect_to_peer(&peer.host, peer.port).await {
                Ok(()) => {
                    tracing::info!(peer = %peer, "connected to peer");
                    dialed = true;
                }
                Err(e) => tracing::warn!(peer = %peer, error = %e, "failed to connect to peer"),
            }
        }

        if dialed {
            self.set_state(ConnectionState::Connected).await;
            if let Err(e) = self.announce_manifest().await {
                tracing::warn!(error = %e, "failed to announce manifest");
            }
            if let Err(e) = self.flush_outbox(&self.inner.shutdown).await {
                tracing::warn!(error = %e, "failed to flush outbox");
            }
        } else if !self.inner.transport.is_connected().await {
            self.set_state(ConnectionState::Disconnected).await;
        }
    }

    // === Blocking work ===

    /// Run `f` against the store on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&TaskStore) -> Result<T, SyncError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.inner.store.clone();
        run_blocking(move || {
            let store = lock(&store)?;
            f(&*store)
        })
        .await
    }

    /// Run `f` against the outbox on the blocking pool.
    async fn with_outbox<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut Outbox) -> Result<T, SyncError> + Send + 'static,
        T: Send + 'static,
    {
        let outbox = self.inner.outbox.clone();
        run_blocking(move || {
            let mut outbox = lock(&outbox)?;
            f(&mut *outbox)
        })
        .await
    }

    // === Local-store facade ===

    /// Commit one local mutation and publish it before the next one starts.
    async fn commit_local<F>(&self, mutate: F) -> Result<Task, SyncError>
    where
        F: FnOnce(&TaskStore) -> Result<(Task, SyncEvent), StoreError> + Send + 'static,
    {
        let _order = self.inner.local_order.lock().await;
        let (task, event) = self.with_store(move |store| Ok(mutate(store)?)).await?;
        self.committed(event, ChangeOrigin::Local).await;
        Ok(task)
    }

    pub async fn add_task(&self, task: Task) -> Result<Task, SyncError> {
        self.commit_local(move |store| store.add_task(task)).await
    }

    pub async fn update_task(&self, task: Task) -> Result<Task, SyncError> {
        self.commit_local(move |store| store.update_task(task)).await
    }

    pub async fn mark_done(&self, id: &str) -> Result<Task, SyncError> {
        let id = id.to_string();
        self.commit_local(move |store| store.mark_done(&id)).await
    }

    pub async fn snooze(&self, id: &str, until: DateTime<Utc>) -> Result<Task, SyncError> {
        let id = id.to_string();
        self.commit_local(move |store| store.snooze(&id, until)).await
    }

    pub async fn resume(&self, id: &str) -> Result<Task, SyncError> {
        let id = id.to_string();
        self.commit_local(move |store| store.resume(&id)).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), SyncError> {
        let _order = self.inner.local_order.lock().await;
        let id = id.to_string();
        let event = self.with_store(move |store| Ok(store.delete_task(&id)?)).await?;
        self.committed(event, ChangeOrigin::Local).await;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, SyncError> {
        let id = id.to_string();
        self.with_store(move |store| Ok(store.get_task(&id)?)).await
    }

    pub async fn get_tasks(
        &self,
        user_id: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<Vec<Task>, SyncError> {
        let user_id = user_id.map(str::to_string);
        let device_id = device_id.map(str::to_string);
        self.with_store(move |store| Ok(store.get_tasks(user_id.as_deref(), device_id.as_deref())?))
            .await
    }

    pub async fn tombstone(&self, id: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        let id = id.to_string();
        self.with_store(move |store| Ok(store.tombstone(&id)?)).await
    }

    pub async fn manifest(&self, user_id: Option<&str>) -> Result<Vec<ManifestEntry>, SyncError> {
        let user_id = user_id.map(str::to_string);
        self.with_store(move |store| Ok(store.manifest(user_id.as_deref())?))
            .await
    }

    /// Notify subscribers and, for local changes, publish to peers.
    ///
    /// A local mutation has already committed; publication failures are
    /// logged and never surface to the caller.
    async fn committed(&self, event: SyncEvent, origin: ChangeOrigin) {
        let publish = origin.is_local();
        let _ = self.inner.changes.send(AppliedChange {
            event: event.clone(),
            origin,
        });
        if publish {
            if let Err(e) = self.publish(event).await {
                tracing::warn!(error = %e, "failed to publish local change");
            }
        }
    }

    // === Publish path ===

    /// Send `event` to peers, queueing task events that cannot be delivered.
    pub async fn publish(&self, event: SyncEvent) -> Result<(), SyncError> {
        let cancel = self.inner.shutdown.clone();
        self.publish_with_cancel(event, &cancel).await
    }

    pub async fn publish_with_cancel(
        &self,
        event: SyncEvent,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        if self.inner.transport.is_connected().await {
            match self.inner.transport.send(&event).await {
                Ok(()) => {
                    self.mark_synced().await;
                    self.flush_outbox(cancel).await?;
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(event = event.type_name(), error = %e, "send failed");
                    self.set_state(ConnectionState::Disconnected).await;
                }
                Err(e) => return Err(e),
            }
        } else {
            self.set_state(ConnectionState::Disconnected).await;
        }

        // Manifest exchange is connection-scoped and never queued.
        if event.task_id().is_none() {
            return Err(SyncError::NotConnected);
        }
        self.enqueue(&event).await
    }

    async fn enqueue(&self, event: &SyncEvent) -> Result<(), SyncError> {
        let entry = PendingEvent::from_event(event, self.inner.clock.now())?;
        let pending = self
            .with_outbox(move |outbox| {
                outbox.push(entry)?;
                Ok(outbox.len())
            })
            .await?;
        tracing::debug!(
            event = event.type_name(),
            task_id = event.task_id().unwrap_or("-"),
            pending,
            "queued event"
        );
        Ok(())
    }

    /// Deliver queued events oldest-first.
    ///
    /// Undecodable entries stay queued. Stops at the first send failure or
    /// on cancellation, leaving the rest pending. Returns how many entries
    /// were delivered.
    pub async fn flush_outbox(&self, cancel: &CancellationToken) -> Result<usize, SyncError> {
        let _flushing = self.inner.flush_lock.lock().await;
        let entries = self.with_outbox(|outbox| Ok(outbox.snapshot())).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut delivered = Vec::new();
        for entry in entries {
            if cancel.is_cancelled() {
                break;
            }
            let event = match entry.decode() {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(type_name = %entry.type_name, error = %e, "keeping undecodable outbox entry");
                    continue;
                }
            };

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = self.inner.transport.send(&event) => sent,
            };
            match sent {
                Ok(()) => delivered.push(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "outbox flush interrupted");
                    self.set_state(ConnectionState::Disconnected).await;
                    break;
                }
            }
        }

        let removed = if delivered.is_empty() {
            0
        } else {
            self.with_outbox(move |outbox| outbox.remove_delivered(&delivered))
                .await?
        };
        if removed > 0 {
            self.mark_synced().await;
            tracing::info!(delivered = removed, "flushed outbox");
        }
        Ok(removed)
    }

    /// Publish this node's manifest so peers can reconcile against it.
    pub async fn announce_manifest(&self) -> Result<(), SyncError> {
        let user_id = self.inner.config.user_id.clone();
        let entries = self.manifest(user_id.as_deref()).await?;
        tracing::debug!(entries = entries.len(), "announcing manifest");
        self.publish(SyncEvent::ManifestAnnounce {
            device_id: self.device_id().to_string(),
            user_id,
            entries,
        })
        .await
    }

    // === Receive path ===

    /// Apply one event received from a peer.
    ///
    /// A task event is remembered by the dedup window only once it has been
    /// applied without error, so a redelivery after a failure is retried.
    pub async fn handle_inbound(&self, event: SyncEvent) -> Result<(), SyncError> {
        if self.inner.identity.is_self(event.device_id()) {
            tracing::debug!(event = event.type_name(), "ignoring echo of own event");
            return Ok(());
        }

        let dedup_key = event.dedup_key();
        if let Some(key) = &dedup_key {
            let now = self.inner.clock.now();
            if self.inner.dedup.lock().await.is_duplicate(key, now) {
                tracing::debug!(key = %key, "dropping duplicate event");
                return Ok(());
            }
        }

        self.set_state(ConnectionState::Connected).await;
        let origin = ChangeOrigin::Remote {
            device_id: event.device_id().to_string(),
        };

        match &event {
            SyncEvent::TaskUpserted {
                task, updated_at, ..
            } => {
                let (incoming, updated_at) = (task.clone(), *updated_at);
                let (applied, tombstone) = self
                    .with_store(move |store| {
                        let id = incoming.id.clone();
                        let applied = store.apply_remote_upsert(incoming, updated_at)?;
                        let tombstone = if applied { None } else { store.tombstone(&id)? };
                        Ok((applied, tombstone))
                    })
                    .await?;
                self.remember(dedup_key).await;

                if applied {
                    self.mark_synced().await;
                    self.committed(event.clone(), origin).await;
                } else if let Some(deleted_at) = tombstone.filter(|d| *d >= updated_at) {
                    // The sender still holds a row we deleted; tell it.
                    let reply = SyncEvent::task_deleted(&task.id, self.device_id(), deleted_at)?;
                    self.publish(reply).await?;
                }
            }
            SyncEvent::TaskDeleted {
                task_id,
                deleted_at,
                ..
            } => {
                let (id, deleted_at) = (task_id.clone(), *deleted_at);
                let applied = self
                    .with_store(move |store| Ok(store.apply_remote_delete(&id, deleted_at)?))
                    .await?;
                self.remember(dedup_key).await;

                if applied {
                    self.mark_synced().await;
                    self.committed(event.clone(), origin).await;
                }
            }
            SyncEvent::ManifestAnnounce {
                device_id,
                user_id,
                entries,
            } => {
                self.reconcile(device_id, user_id.as_deref(), entries).await?;
            }
            SyncEvent::TasksRequested { task_ids, .. } => {
                self.answer_request(task_ids).await?;
            }
        }

        if let Err(e) = self.flush_outbox(&self.inner.shutdown).await {
            tracing::warn!(error = %e, "failed to flush outbox");
        }
        Ok(())
    }

    async fn remember(&self, dedup_key: Option<String>) {
        if let Some(key) = dedup_key {
            let now = self.inner.clock.now();
            self.inner.dedup.lock().await.record(key, now);
        }
    }

    /// Answer a peer's manifest: request what it has newer, push what we
    /// have newer, and answer with deletions where our tombstone wins.
    async fn reconcile(
        &self,
        peer: &str,
        user_id: Option<&str>,
        entries: &[ManifestEntry],
    ) -> Result<(), SyncError> {
        let scope = user_id
            .or(self.inner.config.user_id.as_deref())
            .map(str::to_string);
        let remote = entries.to_vec();
        let (peer_id, local_id) = (peer.to_string(), self.device_id().to_string());

        let (request, replies) = self
            .with_store(move |store| {
                let diff = store.compare_manifest(&remote, scope.as_deref(), Some(peer_id.as_str()))?;
                if diff.is_in_sync() {
                    return Ok((Vec::new(), Vec::new()));
                }

                let mut request = Vec::new();
                let mut replies = Vec::new();
                for id in diff.tasks_to_request() {
                    let remote_updated = remote
                        .iter()
                        .filter(|e| e.task_id == id)
                        .map(|e| e.updated_at)
                        .max();
                    match (store.tombstone(&id)?, remote_updated) {
                        (Some(deleted_at), Some(updated)) if deleted_at >= updated => {
                            replies.push(SyncEvent::task_deleted(id, local_id.as_str(), deleted_at)?);
                        }
                        _ => request.push(id),
                    }
                }
                for id in diff.tasks_to_advertise() {
                    if let Some(task) = store.get_task(&id)? {
                        replies.push(SyncEvent::task_upserted(task, local_id.as_str())?);
                    }
                }
                Ok((request, replies))
            })
            .await?;

        tracing::info!(
            peer = %peer,
            requesting = request.len(),
            pushing = replies.len(),
            "reconciling with peer"
        );

        if !request.is_empty() {
            self.publish(SyncEvent::TasksRequested {
                device_id: self.device_id().to_string(),
                task_ids: request,
            })
            .await?;
        }
        for reply in replies {
            self.publish(reply).await?;
        }
        Ok(())
    }

    /// Send whole records (or deletions) for ids a peer asked for.
    async fn answer_request(&self, task_ids: &[String]) -> Result<(), SyncError> {
        let ids = task_ids.to_vec();
        let local_id = self.device_id().to_string();
        let replies = self
            .with_store(move |store| {
                let mut replies = Vec::new();
                for id in ids {
                    if let Some(task) = store.get_task(&id)? {
                        replies.push(SyncEvent::task_upserted(task, local_id.as_str())?);
                    } else if let Some(deleted_at) = store.tombstone(&id)? {
                        replies.push(SyncEvent::task_deleted(id, local_id.as_str(), deleted_at)?);
                    } else {
                        tracing::debug!(task_id = %id, "requested task is unknown");
                    }
                }
                Ok(replies)
            })
            .await?;

        for reply in replies {
            self.publish(reply).await?;
        }
        Ok(())
    }

    // === State ===

    pub async fn connection_state(&self) -> ConnectionState {
        *self.inner.state.lock().await
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.inner.state.lock().await;
        let prev = *state;
        if prev != next {
            tracing::info!(from = %prev, to = %next, "connection state changed");
            *state = next;
        }
    }

    async fn mark_synced(&self) {
        *self.inner.last_sync_at.lock().await = Some(self.inner.clock.now());
    }

    pub async fn pending_count(&self) -> usize {
        match self.with_outbox(|outbox| Ok(outbox.len())).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read outbox length");
                0
            }
        }
    }

    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            device_id: self.device_id().to_string(),
            connection: self.connection_state().await,
            pending_count: self.pending_count().await,
            last_sync_at: *self.inner.last_sync_at.lock().await,
        }
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> Result<MutexGuard<'_, T>, SyncError> {
    mutex
        .lock()
        .map_err(|_| SyncError::Worker("lock poisoned by a panicked task".into()))
}

async fn run_blocking<T, F>(f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Worker(e.to_string()))?
}
