use std::{collections::{BTreeMap, HashMap, VecDeque}, time::{Duration, Instant}};

use chrono::{DateTime, Utc};
use discovery::PeerDirectory;
use msgs::{
    chunk::{ChunkCoordinate, ChunkState, CompletionStatus},
    config::SessionTimings,
    error::SyncError,
    lock::ChunkLock,
    model::{Delta, Snapshot, MAX_SNAPSHOT_PEERS},
    peer::{PeerId, PeerInfo},
    server_client_msg::{LockDenial, LockOutcome, ReleaseOutcome, UpdateOutcome},
};

use crate::lock_table::LockTable;

/// What one peer should receive on the next flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Deltas (Vec<Delta>),
    Snapshot (Snapshot),
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired_locks: Vec<ChunkLock>,
    /// Peers whose liveness ran out, with the locks that were freed for them.
    pub timed_out: Vec<(PeerInfo, Vec<ChunkLock>)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_locks.is_empty() && self.timed_out.is_empty()
    }
}

/// Accepted edits kept for the console.
pub const HISTORY_LEN: usize = 256;

/// One accepted edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub coordinate: ChunkCoordinate,
    pub previous: CompletionStatus,
    pub status: CompletionStatus,
    pub version: u64,
    pub author: PeerId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub revision: u64,
    pub peers: usize,
    pub locks: usize,
    pub empty: usize,
    pub partial: usize,
    pub complete: usize,
    pub pending: usize,
    pub lagging: usize,
}

/// Authoritative session data. Not synchronized; [`crate::host::SessionHost`]
/// keeps it behind a single mutex. Every time-dependent call takes `now`.
#[derive(Debug)]
pub struct SessionState {
    chunks: BTreeMap<ChunkCoordinate, ChunkState>,
    locks: LockTable,
    directory: PeerDirectory,
    acked_revision: HashMap<PeerId, u64>,
    local_peer: Option<PeerId>,
    revision: u64,
    pending: Vec<(PeerId, Delta)>,
    history: VecDeque<ChangeRecord>,
    liveness_timeout: Duration,
    resync_threshold: u64,
}

impl SessionState {
    pub fn new(timings: &SessionTimings) -> SessionState {
        SessionState {
            chunks: BTreeMap::new(),
            locks: LockTable::new(timings.lock_ttl),
            directory: PeerDirectory::new(),
            acked_revision: HashMap::new(),
            local_peer: None,
            revision: 0,
            pending: Vec::new(),
            history: VecDeque::with_capacity(HISTORY_LEN),
            liveness_timeout: timings.peer_liveness_timeout,
            resync_threshold: timings.resync_threshold,
        }
    }

    pub fn seed(&mut self, states: impl IntoIterator<Item = ChunkState>) {
        for state in states {
            self.chunks.insert(state.coordinate, state);
        }
    }

    /// The host's own participant: always present, never timed out, never
    /// sent broadcasts.
    pub fn add_local_peer(&mut self, info: PeerInfo, now: Instant) {
        self.local_peer = Some(info.peer_id);
        self.directory.insert_pinned(info, now);
    }

    pub fn accept_peer(&mut self, info: PeerInfo, now: Instant) -> Result<Snapshot, SyncError> {
        if self.directory.contains(&info.peer_id) {
            return Err(SyncError::DuplicatePeer (info.peer_id));
        }
        if self.directory.len() >= MAX_SNAPSHOT_PEERS {
            return Err(SyncError::SessionFull (MAX_SNAPSHOT_PEERS));
        }
        self.acked_revision.insert(info.peer_id, self.revision);
        self.directory.upsert(info, now);
        Ok(self.snapshot())
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.directory.contains(peer_id)
    }

    pub fn touch(&mut self, peer_id: &PeerId, now: Instant) -> bool {
        self.directory.touch(peer_id, now)
    }

    pub fn request_lock(&mut self, peer_id: PeerId, coordinate: ChunkCoordinate, now: Instant) -> LockOutcome {
        if !self.chunks.contains_key(&coordinate) {
            return LockOutcome::Denied (LockDenial::UnknownChunk);
        }
        match self.locks.acquire(peer_id, coordinate, now) {
            Ok(lock) => LockOutcome::Granted (lock),
            Err(holder) => LockOutcome::Denied (LockDenial::AlreadyLocked (holder)),
        }
    }

    pub fn release_lock(&mut self, peer_id: PeerId, coordinate: ChunkCoordinate) -> ReleaseOutcome {
        self.locks.release(peer_id, coordinate)
    }

    pub fn lock_holder(&self, coordinate: &ChunkCoordinate, now: Instant) -> Option<PeerId> {
        self.locks.holder_of(coordinate, now)
    }

    pub fn submit_update(
        &mut self,
        peer_id: PeerId,
        coordinate: ChunkCoordinate,
        status: CompletionStatus,
        expected_version: u64,
        now: Instant,
    ) -> UpdateOutcome {
        let holds_lock = self.locks.is_held_by(&peer_id, &coordinate, now);
        let Some(chunk) = self.chunks.get_mut(&coordinate) else {
            return UpdateOutcome::UnknownChunk;
        };
        if !holds_lock {
            return UpdateOutcome::NotLockHolder { current: chunk.clone() };
        }
        if chunk.version != expected_version {
            return UpdateOutcome::Rejected { current: chunk.clone() };
        }

        let previous = chunk.status;
        chunk.version += 1;
        chunk.status = status;
        chunk.last_modified_by = Some(peer_id);
        let delta = Delta::of(chunk, peer_id);
        let version = chunk.version;

        self.revision += 1;
        self.pending.push((peer_id, delta));
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(ChangeRecord { coordinate, previous, status, version, author: peer_id, at: Utc::now() });
        UpdateOutcome::Accepted { version }
    }

    pub fn heartbeat(&mut self, peer_id: &PeerId, revision: u64, now: Instant) -> bool {
        if !self.directory.touch(peer_id, now) {
            return false;
        }
        if let Some(acked) = self.acked_revision.get_mut(peer_id) {
            *acked = revision.min(self.revision);
        }
        true
    }

    /// Drops a peer and frees its locks.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<(PeerInfo, Vec<ChunkLock>)> {
        if self.local_peer.as_ref() == Some(peer_id) {
            return None;
        }
        let info = self.directory.remove(peer_id)?;
        self.acked_revision.remove(peer_id);
        let released = self.locks.release_all(peer_id);
        Some((info, released))
    }

    /// Lock ttl and peer liveness expire independently.
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let expired_locks = self.locks.sweep(now);
        let timed_out = self.directory.prune(now, self.liveness_timeout)
            .into_iter()
            .map(|info| {
                self.acked_revision.remove(&info.peer_id);
                let released = self.locks.release_all(&info.peer_id);
                (info, released)
            })
            .collect();
        SweepReport { expired_locks, timed_out }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn is_lagging(&self, acked: u64) -> bool {
        self.revision.saturating_sub(acked) > self.resync_threshold
    }

    /// True when some peer is owed a snapshot, even with no deltas queued.
    pub fn has_lagging(&self) -> bool {
        self.acked_revision.values().any(|acked| self.is_lagging(*acked))
    }

    /// Drains the delta outbox into per-peer batches. A peer lagging more
    /// than the resync threshold gets a full snapshot instead.
    pub fn take_broadcasts(&mut self) -> Vec<(PeerId, Outbound)> {
        let pending = std::mem::take(&mut self.pending);
        let mut lagging = Vec::new();
        let mut out = Vec::new();

        for (peer_id, acked) in &self.acked_revision {
            if self.is_lagging(*acked) {
                lagging.push(*peer_id);
                continue;
            }
            let deltas: Vec<Delta> = pending.iter()
                .filter(|(origin, _)| origin != peer_id)
                .map(|(_, delta)| *delta)
                .collect();
            if !deltas.is_empty() {
                out.push((*peer_id, Outbound::Deltas (deltas)));
            }
        }

        if !lagging.is_empty() {
            let snapshot = self.snapshot();
            for peer_id in lagging {
                // assume delivery; the next heartbeat corrects it
                self.acked_revision.insert(peer_id, self.revision);
                out.push((peer_id, Outbound::Snapshot (snapshot.clone())));
            }
        }

        out.sort_by_key(|(peer_id, _)| *peer_id);
        out
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            revision: self.revision,
            chunks: self.chunks.values().cloned().collect(),
            locks: self.locks.locks(),
            peers: self.directory.peers(),
        }
    }

    pub fn chunk(&self, coordinate: &ChunkCoordinate) -> Option<&ChunkState> {
        self.chunks.get(coordinate)
    }

    pub fn chunks(&self) -> Vec<ChunkState> {
        self.chunks.values().cloned().collect()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.directory.peers()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.directory.get(peer_id)
    }

    pub fn locks(&self) -> Vec<ChunkLock> {
        self.locks.locks()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The most recent accepted edits, oldest first.
    pub fn history(&self, limit: usize) -> Vec<ChangeRecord> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn summary(&self) -> SessionSummary {
        let count = |status: CompletionStatus| self.chunks.values().filter(|c| c.status == status).count();
        SessionSummary {
            revision: self.revision,
            peers: self.directory.len(),
            locks: self.locks.locks().len(),
            empty: count(CompletionStatus::Empty),
            partial: count(CompletionStatus::Partial),
            complete: count(CompletionStatus::Complete),
            pending: self.pending.len(),
            lagging: self.acked_revision.values().filter(|acked| self.is_lagging(**acked)).count(),
        }
    }
}
