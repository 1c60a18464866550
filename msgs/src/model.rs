use crate::{
    chunk::{ChunkCoordinate, ChunkState, CompletionStatus},
    codec::{MAX_LIST_LEN, MAX_STRING_LEN},
    dequeue::MAX_FRAME_LEN,
    lock::ChunkLock,
    peer::{PeerId, PeerInfo},
};

/// Peers a session admits, the host included.
pub const MAX_SNAPSHOT_PEERS: usize = 64;

// encoded sizes, see codec.rs
const CHUNK_STATE_MAX_LEN: usize = 4 + 1 + 8 + 1 + 16;
const LOCK_LEN: usize = 4 + 16 + 8 + 8;
const PEER_INFO_MAX_LEN: usize = 16 + 4 + MAX_STRING_LEN + 1 + 16 + 2 + 1;
const SNAPSHOT_HEADER_LEN: usize = 4 + 8 + 3 * 4;

/// Chunks a snapshot can hold and still fit one frame when every chunk
/// has an author and a lock and the session is full of peers with
/// longest-possible names.
pub const MAX_SNAPSHOT_CHUNKS: usize = {
    let room = MAX_FRAME_LEN - SNAPSHOT_HEADER_LEN - MAX_SNAPSHOT_PEERS * PEER_INFO_MAX_LEN;
    let fits = room / (CHUNK_STATE_MAX_LEN + LOCK_LEN);
    if fits < MAX_LIST_LEN { fits } else { MAX_LIST_LEN }
};

/// Fails when a grid has more chunks than one snapshot can carry.
pub fn check_chunk_count(count: usize) -> anyhow::Result<()> {
    if count > MAX_SNAPSHOT_CHUNKS {
        anyhow::bail!("{count} chunks do not fit in a snapshot, the limit is {MAX_SNAPSHOT_CHUNKS}");
    }
    Ok(())
}

/// Full copy of the session, sent on connect and on resync.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Number of updates the host had accepted when the snapshot was taken.
    pub revision: u64,
    pub chunks: Vec<ChunkState>,
    pub locks: Vec<ChunkLock>,
    pub peers: Vec<PeerInfo>,
}

/// One accepted update, fanned out to every peer except its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    pub coordinate: ChunkCoordinate,
    pub status: CompletionStatus,
    pub version: u64,
    pub modified_by: PeerId,
}

impl Delta {
    pub fn of(state: &ChunkState, modified_by: PeerId) -> Delta {
        Delta {
            coordinate: state.coordinate,
            status: state.status,
            version: state.version,
            modified_by,
        }
    }
}
