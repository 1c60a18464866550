use std::io;

use thiserror::Error;

use crate::{chunk::ChunkCoordinate, peer::PeerId};

/// Failures surfaced by the sync subsystem to its callers.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("host unreachable at {address}: {reason}")]
    NetworkUnreachable { address: String, reason: String },

    #[error("peer id {0} is already connected")]
    DuplicatePeer (PeerId),

    #[error("chunk {coordinate} is locked by {holder}")]
    LockConflict { coordinate: ChunkCoordinate, holder: PeerId },

    #[error("chunk {coordinate} changed under us, host is at version {current}")]
    VersionConflict { coordinate: ChunkCoordinate, current: u64 },

    #[error("peer {0} timed out")]
    PeerTimeout (PeerId),

    #[error("malformed message: {0}")]
    MalformedMessage (String),

    #[error("not holding the lock for chunk {0}")]
    NotLockHolder (ChunkCoordinate),

    #[error("chunk {0} is not part of this session")]
    UnknownChunk (ChunkCoordinate),

    #[error("session is full ({0} peers)")]
    SessionFull (usize),

    #[error("session closed")]
    SessionClosed,

    #[error("io error: {0}")]
    Io (#[from] io::Error),
}

impl SyncError {
    /// Lock and version conflicts are expected during normal use; the user
    /// may simply retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::LockConflict { .. } | SyncError::VersionConflict { .. } | SyncError::NotLockHolder (_))
    }
}
