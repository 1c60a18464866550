use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{chunk::ChunkCoordinate, peer::PeerId};

/// Exclusive claim on one chunk while a peer edits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLock {
    pub coordinate: ChunkCoordinate,
    pub holder: PeerId,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl ChunkLock {
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.acquired_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
