use std::collections::BTreeMap;

use msgs::{
    chunk::{ChunkCoordinate, ChunkState, CompletionStatus},
    lock::ChunkLock,
    model::{Delta, Snapshot},
    peer::{PeerId, PeerInfo},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    /// Already have this version or newer.
    Stale,
    /// Something was missed; only a snapshot can repair it.
    Gap,
}

/// Local copy of the host's session. Deltas are applied strictly in
/// version order per chunk.
#[derive(Debug, Default)]
pub struct ChunkMirror {
    chunks: BTreeMap<ChunkCoordinate, ChunkState>,
    locks: BTreeMap<ChunkCoordinate, ChunkLock>,
    peers: BTreeMap<PeerId, PeerInfo>,
    revision: u64,
    resync_pending: bool,
}

impl ChunkMirror {
    pub fn new() -> ChunkMirror {
        ChunkMirror::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> ChunkMirror {
        let mut mirror = ChunkMirror::new();
        mirror.apply_snapshot(snapshot);
        mirror
    }

    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        self.chunks = snapshot.chunks.into_iter().map(|c| (c.coordinate, c)).collect();
        self.locks = snapshot.locks.into_iter().map(|l| (l.coordinate, l)).collect();
        self.peers = snapshot.peers.into_iter().map(|p| (p.peer_id, p)).collect();
        self.revision = snapshot.revision;
        self.resync_pending = false;
    }

    pub fn apply_delta(&mut self, delta: &Delta) -> DeltaOutcome {
        let Some(chunk) = self.chunks.get_mut(&delta.coordinate) else {
            return DeltaOutcome::Gap;
        };
        if delta.version <= chunk.version {
            return DeltaOutcome::Stale;
        }
        if delta.version != chunk.version + 1 {
            return DeltaOutcome::Gap;
        }
        chunk.version = delta.version;
        chunk.status = delta.status;
        chunk.last_modified_by = Some(delta.modified_by);
        self.revision += 1;
        DeltaOutcome::Applied
    }

    /// True the first time after a gap; later calls wait for the snapshot.
    pub fn request_resync(&mut self) -> bool {
        !std::mem::replace(&mut self.resync_pending, true)
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_pending
    }

    /// Optimistic edit before the host answers. Returns the version the
    /// edit is based on.
    pub fn apply_local(&mut self, coordinate: &ChunkCoordinate, status: CompletionStatus) -> Option<u64> {
        let chunk = self.chunks.get_mut(coordinate)?;
        chunk.status = status;
        Some(chunk.version)
    }

    /// The host accepted our edit. Ignored when a snapshot or delta has
    /// already brought the chunk to that version or past it.
    pub fn confirm(&mut self, coordinate: &ChunkCoordinate, status: CompletionStatus, version: u64, by: PeerId) -> bool {
        let Some(chunk) = self.chunks.get_mut(coordinate) else {
            return false;
        };
        if version <= chunk.version {
            return false;
        }
        chunk.status = status;
        chunk.version = version;
        chunk.last_modified_by = Some(by);
        self.revision += 1;
        true
    }

    /// Replaces a chunk with the host's authoritative state.
    pub fn overwrite(&mut self, state: ChunkState) {
        self.chunks.insert(state.coordinate, state);
    }

    pub fn lock_acquired(&mut self, lock: ChunkLock) {
        self.locks.insert(lock.coordinate, lock);
    }

    pub fn lock_released(&mut self, coordinate: &ChunkCoordinate) -> Option<ChunkLock> {
        self.locks.remove(coordinate)
    }

    pub fn peer_joined(&mut self, info: PeerInfo) {
        self.peers.insert(info.peer_id, info);
    }

    pub fn peer_left(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.locks.retain(|_, lock| lock.holder != *peer_id);
        self.peers.remove(peer_id)
    }

    pub fn chunk(&self, coordinate: &ChunkCoordinate) -> Option<&ChunkState> {
        self.chunks.get(coordinate)
    }

    pub fn chunks(&self) -> Vec<ChunkState> {
        self.chunks.values().cloned().collect()
    }

    pub fn lock(&self, coordinate: &ChunkCoordinate) -> Option<&ChunkLock> {
        self.locks.get(coordinate)
    }

    pub fn locks(&self) -> Vec<ChunkLock> {
        self.locks.values().cloned().collect()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().cloned().collect()
    }

    pub fn host(&self) -> Option<&PeerInfo> {
        self.peers.values().find(|p| p.is_host)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}
