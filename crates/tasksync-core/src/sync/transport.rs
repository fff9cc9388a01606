//! Peer transport.
//!
//! [`TcpTransport`] speaks newline-delimited JSON: one [`SyncEvent`] per line,
//! in both directions, on every accepted or dialed stream. Each stream gets a
//! reader task that decodes lines into the shared inbound channel.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::sync::event::SyncEvent;
use crate::sync::types::SyncError;

const INBOUND_BUFFER: usize = 256;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Event-level transport between peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start accepting peers. Returns the bound address.
    async fn start_listening(&self) -> Result<SocketAddr, SyncError>;

    /// Dial a peer.
    async fn connect_to_peer(&self, host: &str, port: u16) -> Result<(), SyncError>;

    /// Deliver `event` to connected peers.
    ///
    /// Succeeds if at least one peer accepted the event.
    async fn send(&self, event: &SyncEvent) -> Result<(), SyncError>;

    /// True if any peer is connected.
    async fn is_connected(&self) -> bool;

    /// True if a stream dialed to `host:port` is still open.
    async fn is_connected_to(&self, host: &str, port: u16) -> bool;

    /// Take the receiving end of the inbound event channel. Only the first
    /// call returns `Some`.
    async fn take_inbound(&self) -> Option<mpsc::Receiver<SyncEvent>>;

    /// Stop listening and drop every peer.
    async fn shutdown(&self);
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

struct PeerConn {
    remote: SocketAddr,
    /// `host:port` as dialed, for outbound streams.
    dialed: Option<String>,
    writer: SharedWriter,
    /// Stops this peer's reader task.
    closed: CancellationToken,
}

/// State shared between the transport and its accept/reader tasks.
///
/// The peer map lock is only held to insert, remove or snapshot peers; writes
/// go through each peer's own writer lock.
#[derive(Clone)]
struct Connections {
    peers: Arc<Mutex<HashMap<u64, PeerConn>>>,
    next_id: Arc<AtomicU64>,
    inbound_tx: mpsc::Sender<SyncEvent>,
    cancel: CancellationToken,
}

impl Connections {
    async fn register(&self, stream: TcpStream, dialed: Option<String>) -> Result<(), SyncError> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let closed = self.cancel.child_token();

        self.peers.lock().await.insert(
            id,
            PeerConn {
                remote,
                dialed,
                writer: Arc::new(Mutex::new(writer)),
                closed: closed.clone(),
            },
        );

        let this = self.clone();
        tokio::spawn(async move { this.read_loop(id, remote, reader, closed).await });
        Ok(())
    }

    /// Forget a peer and stop its reader.
    async fn drop_peer(&self, id: u64) {
        if let Some(peer) = self.peers.lock().await.remove(&id) {
            peer.closed.cancel();
        }
    }

    async fn read_loop(
        self,
        id: u64,
        remote: SocketAddr,
        reader: OwnedReadHalf,
        closed: CancellationToken,
    ) {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                _ = closed.cancelled() => break,
                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match SyncEvent::from_json(&line) {
                        Ok(event) => {
                            if self.inbound_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(peer = %remote, error = %e, "dropping undecodable line");
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!(peer = %remote, "peer closed connection");
                    break;
                }
                Err(e) => {
                    tracing::warn!(peer = %remote, error = %e, "read failed");
                    break;
                }
            }
        }
        self.drop_peer(id).await;
    }
}

/// Write one line to a peer, giving up after `deadline`.
async fn write_line(writer: SharedWriter, line: Arc<str>, deadline: Duration) -> Result<(), String> {
    let write = async move {
        let mut writer = writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    };
    match tokio::time::timeout(deadline, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write timed out after {deadline:?}")),
    }
}

/// TCP transport carrying one JSON event per line.
pub struct TcpTransport {
    bind_addr: SocketAddr,
    send_timeout: Duration,
    conns: Connections,
    inbound_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
}

impl TcpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        Self {
            bind_addr,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            conns: Connections {
                peers: Arc::new(Mutex::new(HashMap::new())),
                next_id: Arc::new(AtomicU64::new(0)),
                inbound_tx,
                cancel: CancellationToken::new(),
            },
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Deadline for writing one event to one peer. A peer that stops
    /// reading is dropped once it is missed.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start_listening(&self) -> Result<SocketAddr, SyncError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| SyncError::Transport(format!("bind {}: {e}", self.bind_addr)))?;
        let local = listener.local_addr()?;

        let conns = self.conns.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = conns.cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            tracing::debug!(peer = %addr, "accepted connection");
                            if let Err(e) = conns.register(stream, None).await {
                                tracing::warn!(peer = %addr, error = %e, "failed to register peer");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
        });

        Ok(local)
    }

    async fn connect_to_peer(&self, host: &str, port: u16) -> Result<(), SyncError> {
        let label = format!("{host}:{port}");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| SyncError::Transport(format!("connect {label}: timed out")))?
            .map_err(|e| SyncError::Transport(format!("connect {label}: {e}")))?;
        self.conns.register(stream, Some(label)).await
    }

    async fn send(&self, event: &SyncEvent) -> Result<(), SyncError> {
        let mut line = event.to_json()?;
        line.push('\n');
        let line: Arc<str> = Arc::from(line);

        let targets: Vec<(u64, SocketAddr, SharedWriter)> = {
            let peers = self.conns.peers.lock().await;
            peers
                .iter()
                .map(|(id, peer)| (*id, peer.remote, peer.writer.clone()))
                .collect()
        };
        if targets.is_empty() {
            return Err(SyncError::NotConnected);
        }

        // Peers are written concurrently so one slow peer costs the others
        // nothing.
        let mut writes = JoinSet::new();
        for (id, remote, writer) in targets {
            let line = line.clone();
            let deadline = self.send_timeout;
            writes.spawn(async move { (id, remote, write_line(writer, line, deadline).await) });
        }

        let mut delivered = 0;
        while let Some(joined) = writes.join_next().await {
            let Ok((id, remote, result)) = joined else {
                continue;
            };
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(peer = %remote, error = %e, "write failed; dropping peer");
                    self.conns.drop_peer(id).await;
                }
            }
        }

        if delivered == 0 {
            return Err(SyncError::Transport("send failed on every peer".into()));
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.conns.peers.lock().await.is_empty()
    }

    async fn is_connected_to(&self, host: &str, port: u16) -> bool {
        let label = format!("{host}:{port}");
        self.conns
            .peers
            .lock()
            .await
            .values()
            .any(|p| p.dialed.as_deref() == Some(label.as_str()))
    }

    async fn take_inbound(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.inbound_rx.lock().await.take()
    }

    async fn shutdown(&self) {
        self.conns.cancel.cancel();
        self.conns.peers.lock().await.clear();
    }
}
