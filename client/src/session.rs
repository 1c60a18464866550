use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use msgs::{
    chunk::{ChunkCoordinate, ChunkState, CompletionStatus},
    client_server_msg::ClientServerMsg,
    config::SessionTimings,
    error::SyncError,
    lock::ChunkLock,
    model::MAX_SNAPSHOT_PEERS,
    peer::{PeerId, PeerInfo},
    server_client_msg::{LockDenial, LockOutcome, RejectReason, ReleaseOutcome, ServerClientMsg, UpdateOutcome},
};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{connect_with_retry, read_msg, write_msg, Connection, SessionEvent, Shared, CONNECT_ATTEMPTS, INITIAL_BACKOFF},
    mirror::ChunkMirror,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub peer_id: PeerId,
    pub display_name: String,
}

impl ClientIdentity {
    pub fn new(display_name: impl Into<String>) -> ClientIdentity {
        ClientIdentity { peer_id: PeerId::new(), display_name: display_name.into() }
    }
}

/// A joined session. Edits go through the host: lock, edit, release.
pub struct SessionClient {
    identity: ClientIdentity,
    host_addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    outbound: mpsc::Sender<ClientServerMsg>,
    events: broadcast::Sender<SessionEvent>,
    next_request_id: AtomicU32,
    request_timeout: Duration,
    task: JoinHandle<()>,
}

impl SessionClient {
    /// Says hello and waits for the host's snapshot.
    pub async fn connect(host_addr: SocketAddr, identity: ClientIdentity, timings: &SessionTimings) -> Result<SessionClient, SyncError> {
        let mut socket = connect_with_retry(host_addr, CONNECT_ATTEMPTS, INITIAL_BACKOFF).await?;
        socket.set_nodelay(true)?;

        let hello = ClientServerMsg::Hello { peer_id: identity.peer_id, display_name: identity.display_name.clone() };
        write_msg(&mut socket, &hello).await?;

        let mut input_buffer = Vec::new();
        let first = match tokio::time::timeout(timings.peer_liveness_timeout, read_msg(&mut socket, &mut input_buffer)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SyncError::NetworkUnreachable {
                    address: host_addr.to_string(),
                    reason: "host did not answer the hello".into(),
                })
            }
        };
        let snapshot = match first {
            ServerClientMsg::Snapshot (snapshot) => snapshot,
            ServerClientMsg::Rejected (RejectReason::DuplicatePeer) => return Err(SyncError::DuplicatePeer (identity.peer_id)),
            ServerClientMsg::Rejected (RejectReason::SessionFull) => return Err(SyncError::SessionFull (MAX_SNAPSHOT_PEERS)),
            other => return Err(SyncError::MalformedMessage (format!("expected a snapshot, got {other:?}"))),
        };
        info!("joined session at {host_addr} (revision {}, {} chunks)", snapshot.revision, snapshot.chunks.len());

        let shared = Arc::new(Mutex::new(Shared {
            mirror: ChunkMirror::from_snapshot(snapshot),
            ..Shared::default()
        }));
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(256);

        let connection = Connection {
            socket,
            input_buffer,
            shared: shared.clone(),
            outbound: outbound_rx,
            events: events.clone(),
            peer_id: identity.peer_id,
            heartbeat_interval: timings.heartbeat_interval,
            liveness_timeout: timings.peer_liveness_timeout,
            malformed_tolerance: timings.malformed_tolerance,
        };
        let task = tokio::spawn(connection.run());

        Ok(SessionClient {
            identity,
            host_addr,
            shared,
            outbound: outbound_tx,
            events,
            next_request_id: AtomicU32::new(1),
            request_timeout: timings.peer_liveness_timeout,
            task,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn host_addr(&self) -> SocketAddr {
        self.host_addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request(&self, build: impl FnOnce(u32) -> ClientServerMsg) -> Result<ServerClientMsg, SyncError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let host_id = {
            let mut shared = self.shared.lock();
            if shared.closed {
                return Err(SyncError::SessionClosed);
            }
            shared.pending.insert(request_id, tx);
            shared.mirror.host().map(|h| h.peer_id)
        };

        if self.outbound.send(build(request_id)).await.is_err() {
            self.shared.lock().pending.remove(&request_id);
            return Err(SyncError::SessionClosed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SyncError::SessionClosed),
            Err(_) => {
                self.shared.lock().pending.remove(&request_id);
                Err(host_id.map_or(SyncError::SessionClosed, SyncError::PeerTimeout))
            }
        }
    }

    /// Asks the host for the chunk's lock.
    pub async fn begin_edit(&self, coordinate: ChunkCoordinate) -> Result<ChunkLock, SyncError> {
        let reply = self.request(|request_id| ClientServerMsg::LockRequest { request_id, coordinate }).await?;
        let outcome = match reply {
            ServerClientMsg::LockResponse { outcome, .. } => outcome,
            other => return Err(SyncError::MalformedMessage (format!("expected a lock response, got {other:?}"))),
        };
        match outcome {
            LockOutcome::Granted (lock) => {
                let mut shared = self.shared.lock();
                shared.held.insert(coordinate);
                shared.mirror.lock_acquired(lock.clone());
                Ok(lock)
            }
            LockOutcome::Denied (LockDenial::AlreadyLocked (holder)) => Err(SyncError::LockConflict { coordinate, holder }),
            LockOutcome::Denied (LockDenial::UnknownChunk) => Err(SyncError::UnknownChunk (coordinate)),
        }
    }

    /// Applies the edit locally and submits it. On rejection the local
    /// edit is discarded in favour of the host's state.
    pub async fn apply_edit(&self, coordinate: ChunkCoordinate, status: CompletionStatus) -> Result<u64, SyncError> {
        let (expected_version, previous) = {
            let mut shared = self.shared.lock();
            if !shared.held.contains(&coordinate) {
                return Err(SyncError::NotLockHolder (coordinate));
            }
            let Some(previous) = shared.mirror.chunk(&coordinate).cloned() else {
                return Err(SyncError::UnknownChunk (coordinate));
            };
            let expected_version = shared.mirror.apply_local(&coordinate, status).unwrap_or(previous.version);
            (expected_version, previous)
        };

        let reply = match self
            .request(|request_id| ClientServerMsg::UpdateSubmit { request_id, coordinate, status, expected_version })
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                self.shared.lock().mirror.overwrite(previous);
                return Err(e);
            }
        };
        let outcome = match reply {
            ServerClientMsg::UpdateResult { outcome, .. } => outcome,
            other => {
                self.shared.lock().mirror.overwrite(previous);
                return Err(SyncError::MalformedMessage (format!("expected an update result, got {other:?}")));
            }
        };

        match outcome {
            UpdateOutcome::Accepted { version } => {
                if !self.shared.lock().mirror.confirm(&coordinate, status, version, self.identity.peer_id) {
                    debug!("{} already past v{version} locally", coordinate.reference());
                }
                Ok(version)
            }
            UpdateOutcome::Rejected { current } => {
                warn!("edit to {} lost to v{}", coordinate.reference(), current.version);
                let version = current.version;
                self.adopt(current);
                Err(SyncError::VersionConflict { coordinate, current: version })
            }
            UpdateOutcome::NotLockHolder { current } => {
                self.shared.lock().held.remove(&coordinate);
                self.adopt(current);
                Err(SyncError::NotLockHolder (coordinate))
            }
            UpdateOutcome::UnknownChunk => {
                self.shared.lock().mirror.overwrite(previous);
                Err(SyncError::UnknownChunk (coordinate))
            }
        }
    }

    fn adopt(&self, current: ChunkState) {
        self.shared.lock().mirror.overwrite(current.clone());
        let _ = self.events.send(SessionEvent::EditRejected { current });
    }

    /// Releases the lock. The chunk stops counting as held either way.
    pub async fn end_edit(&self, coordinate: ChunkCoordinate) -> Result<(), SyncError> {
        self.shared.lock().held.remove(&coordinate);
        let reply = self.request(|request_id| ClientServerMsg::LockRelease { request_id, coordinate }).await?;
        match reply {
            ServerClientMsg::ReleaseResponse { outcome: ReleaseOutcome::Released, .. } => {
                self.shared.lock().mirror.lock_released(&coordinate);
                Ok(())
            }
            ServerClientMsg::ReleaseResponse { outcome: ReleaseOutcome::NotHolder, .. } => Err(SyncError::NotLockHolder (coordinate)),
            other => Err(SyncError::MalformedMessage (format!("expected a release response, got {other:?}"))),
        }
    }

    /// Asks for a full snapshot unless one is already on its way.
    pub async fn resync(&self) -> Result<(), SyncError> {
        {
            let mut shared = self.shared.lock();
            if shared.closed {
                return Err(SyncError::SessionClosed);
            }
            if !shared.mirror.request_resync() {
                return Ok(());
            }
        }
        self.outbound.send(ClientServerMsg::ResyncRequest).await.map_err(|_| SyncError::SessionClosed)
    }

    pub fn chunk(&self, coordinate: &ChunkCoordinate) -> Option<ChunkState> {
        self.shared.lock().mirror.chunk(coordinate).cloned()
    }

    pub fn chunks(&self) -> Vec<ChunkState> {
        self.shared.lock().mirror.chunks()
    }

    pub fn locks(&self) -> Vec<ChunkLock> {
        self.shared.lock().mirror.locks()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.lock().mirror.peers()
    }

    pub fn revision(&self) -> u64 {
        self.shared.lock().mirror.revision()
    }

    pub fn held_locks(&self) -> Vec<ChunkCoordinate> {
        self.shared.lock().held.iter().copied().collect()
    }

    /// Tells the host we are leaving and waits briefly for the goodbye to go out.
    pub async fn disconnect(self) {
        self.shared.lock().leaving = true;
        let _ = self.outbound.send(ClientServerMsg::Disconnect (self.identity.peer_id)).await;
        let SessionClient { outbound, task, .. } = self;
        drop(outbound);
        if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
            warn!("connection task did not stop in time");
        }
    }
}
