use std::{sync::Arc, time::Instant};

use msgs::{
    chunk::{ChunkCoordinate, ChunkState, CompletionStatus},
    config::SessionTimings,
    error::SyncError,
    model::Snapshot,
    peer::{PeerId, PeerInfo},
    server_client_msg::{LockOutcome, ReleaseOutcome, ServerClientMsg, UpdateOutcome},
};
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    broadcast_msg::{Address, BroadcastMsg},
    chunk_store::ChunkDataProvider,
    session_state::{ChangeRecord, Outbound, SessionState, SessionSummary, SweepReport},
};

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Left,
    TimedOut,
    Malformed,
}

/// What a freshly accepted connection starts from. The receiver was
/// subscribed under the gate, so it sees everything after `snapshot`.
pub struct SessionHandle {
    pub peer_id: PeerId,
    pub snapshot: Snapshot,
    pub receiver: broadcast::Receiver<BroadcastMsg>,
}

/// The authoritative side of a session. Every mutation goes through one
/// mutex; broadcasts are published while it is held so all connections see
/// them in the order they happened.
pub struct SessionHost {
    state: Mutex<SessionState>,
    tx: broadcast::Sender<BroadcastMsg>,
    timings: SessionTimings,
    local: PeerInfo,
}

impl SessionHost {
    pub fn new(local: PeerInfo, timings: SessionTimings, chunks: Vec<ChunkState>) -> SessionHost {
        let mut state = SessionState::new(&timings);
        state.seed(chunks);
        state.add_local_peer(local.clone(), Instant::now());
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        SessionHost {
            state: Mutex::new(state),
            tx,
            timings,
            local,
        }
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    pub fn timings(&self) -> &SessionTimings {
        &self.timings
    }

    fn publish(&self, address: Address, msg: &ServerClientMsg) {
        match msg.to_frame() {
            Ok(frame) => self.publish_frame(address, frame),
            Err(e) => error!("failed to encode {msg:?}: {e}"),
        }
    }

    fn publish_frame(&self, address: Address, frame: Vec<u8>) {
        // no receivers just means nobody is connected
        if self.tx.send(BroadcastMsg::Send (address, frame)).is_err() {
            debug!("broadcast without connected peers");
        }
    }

    fn kick(&self, peer_id: PeerId) {
        let _ = self.tx.send(BroadcastMsg::Kick (peer_id));
    }

    pub fn accept_connection(&self, info: PeerInfo) -> Result<SessionHandle, SyncError> {
        let peer_id = info.peer_id;
        let mut state = self.state.lock();
        let snapshot = state.accept_peer(info.clone(), Instant::now())?;
        let receiver = self.tx.subscribe();
        self.publish(Address::Other (peer_id), &ServerClientMsg::PeerJoined (info.clone()));
        drop(state);

        info!(peer = %peer_id.short(), "{} joined from {}", info.display_name, info.address);
        Ok(SessionHandle { peer_id, snapshot, receiver })
    }

    pub fn request_lock(&self, peer_id: PeerId, coordinate: ChunkCoordinate) -> LockOutcome {
        let mut state = self.state.lock();
        let outcome = state.request_lock(peer_id, coordinate, Instant::now());
        if let LockOutcome::Granted (lock) = &outcome {
            self.publish(Address::Other (peer_id), &ServerClientMsg::LockAcquired (lock.clone()));
        }
        drop(state);

        match &outcome {
            LockOutcome::Granted (_) => debug!(peer = %peer_id.short(), chunk = %coordinate.reference(), "lock granted"),
            LockOutcome::Denied (denial) => debug!(peer = %peer_id.short(), chunk = %coordinate.reference(), "lock denied: {denial:?}"),
        }
        outcome
    }

    pub fn release_lock(&self, peer_id: PeerId, coordinate: ChunkCoordinate) -> ReleaseOutcome {
        let mut state = self.state.lock();
        let outcome = state.release_lock(peer_id, coordinate);
        if outcome == ReleaseOutcome::Released {
            self.publish(Address::Other (peer_id), &ServerClientMsg::LockReleased (coordinate));
        }
        outcome
    }

    pub fn submit_update(&self, peer_id: PeerId, coordinate: ChunkCoordinate, status: CompletionStatus, expected_version: u64) -> UpdateOutcome {
        let outcome = self.state.lock().submit_update(peer_id, coordinate, status, expected_version, Instant::now());
        match &outcome {
            UpdateOutcome::Accepted { version } => {
                debug!(peer = %peer_id.short(), chunk = %coordinate.reference(), version, "update accepted: {status}");
            }
            UpdateOutcome::Rejected { current } => {
                warn!(peer = %peer_id.short(), chunk = %coordinate.reference(), expected_version, current = current.version, "stale update rejected");
            }
            UpdateOutcome::NotLockHolder { .. } => {
                warn!(peer = %peer_id.short(), chunk = %coordinate.reference(), "update without lock rejected");
            }
            UpdateOutcome::UnknownChunk => {
                warn!(peer = %peer_id.short(), chunk = %coordinate, "update for unknown chunk");
            }
        }
        outcome
    }

    pub fn heartbeat(&self, peer_id: &PeerId, revision: u64) -> bool {
        self.state.lock().heartbeat(peer_id, revision, Instant::now())
    }

    /// Any traffic counts as a sign of life. False once the peer is gone.
    pub fn touch(&self, peer_id: &PeerId) -> bool {
        self.state.lock().touch(peer_id, Instant::now())
    }

    pub fn disconnect(&self, peer_id: &PeerId, reason: DisconnectReason) -> bool {
        let mut state = self.state.lock();
        let Some((info, released)) = state.remove_peer(peer_id) else { return false };
        for lock in &released {
            self.publish(Address::Other (*peer_id), &ServerClientMsg::LockReleased (lock.coordinate));
        }
        self.publish(Address::Other (*peer_id), &ServerClientMsg::PeerLeft (*peer_id));
        if reason != DisconnectReason::Left {
            self.kick(*peer_id);
        }
        drop(state);

        match reason {
            DisconnectReason::Left => info!(peer = %peer_id.short(), "{} left", info.display_name),
            _ => warn!(peer = %peer_id.short(), "{} dropped: {reason:?}, released {} locks", info.display_name, released.len()),
        }
        true
    }

    /// Sends queued deltas, or snapshots to peers that fell too far behind.
    pub fn flush_broadcasts(&self) -> usize {
        let mut state = self.state.lock();
        if !state.has_pending() && !state.has_lagging() {
            return 0;
        }
        let batches = state.take_broadcasts();
        let count = batches.len();
        for (peer_id, outbound) in batches {
            let mut frame = Vec::new();
            let encoded = match outbound {
                Outbound::Deltas (deltas) => deltas.into_iter()
                    .try_for_each(|delta| ServerClientMsg::Delta (delta).pack(&mut frame)),
                Outbound::Snapshot (snapshot) => {
                    info!(peer = %peer_id.short(), revision = snapshot.revision, "peer lagging, sending snapshot");
                    ServerClientMsg::Snapshot (snapshot).pack(&mut frame)
                }
            };
            match encoded {
                Ok(()) => self.publish_frame(Address::Peer (peer_id), frame),
                Err(e) => error!(peer = %peer_id.short(), "failed to encode broadcast: {e}"),
            }
        }
        count
    }

    pub fn sweep(&self) -> SweepReport {
        let mut state = self.state.lock();
        let report = state.sweep(Instant::now());
        for lock in &report.expired_locks {
            self.publish(Address::All, &ServerClientMsg::LockReleased (lock.coordinate));
        }
        for (info, released) in &report.timed_out {
            for lock in released {
                self.publish(Address::Other (info.peer_id), &ServerClientMsg::LockReleased (lock.coordinate));
            }
            self.publish(Address::Other (info.peer_id), &ServerClientMsg::PeerLeft (info.peer_id));
            self.kick(info.peer_id);
        }
        drop(state);

        for lock in &report.expired_locks {
            info!(peer = %lock.holder.short(), chunk = %lock.coordinate.reference(), "lock expired");
        }
        for (info, released) in &report.timed_out {
            warn!(peer = %info.peer_id.short(), "{} timed out, released {} locks", info.display_name, released.len());
        }
        report
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().snapshot()
    }

    pub fn chunk(&self, coordinate: &ChunkCoordinate) -> Option<ChunkState> {
        self.state.lock().chunk(coordinate).cloned()
    }

    pub fn chunks(&self) -> Vec<ChunkState> {
        self.state.lock().chunks()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state.lock().peers()
    }

    pub fn revision(&self) -> u64 {
        self.state.lock().revision()
    }

    pub fn history(&self, limit: usize) -> Vec<ChangeRecord> {
        self.state.lock().history(limit)
    }

    pub fn summary(&self) -> SessionSummary {
        self.state.lock().summary()
    }

    /// Writes every chunk to the provider. The gate is only held to copy.
    pub fn checkpoint(&self, provider: &mut dyn ChunkDataProvider) -> anyhow::Result<usize> {
        let chunks = self.chunks();
        for chunk in &chunks {
            provider.write_chunk(&chunk.coordinate, chunk.status)?;
        }
        provider.flush()?;
        info!("saved {} chunks at revision {}", chunks.len(), self.revision());
        Ok(chunks.len())
    }

    pub fn shutdown(&self) {
        self.flush_broadcasts();
        let state = self.state.lock();
        self.publish(Address::All, &ServerClientMsg::HostShutdown (self.local.peer_id));
        drop(state);
        info!("session closed");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMsg> {
        self.tx.subscribe()
    }

    pub fn spawn_timers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(sync_interval) = self.timings.sync_interval {
            let host = self.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sync_interval);
                loop {
                    ticker.tick().await;
                    host.flush_broadcasts();
                }
            }));
        }

        let host = self.clone();
        let sweep_interval = self.timings.sweep_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                host.sweep();
            }
        }));

        handles
    }
}
