use std::{collections::BTreeMap, time::{Duration, Instant}};

use chrono::{DateTime, Utc};
use msgs::{chunk::ChunkCoordinate, lock::ChunkLock, peer::PeerId, server_client_msg::ReleaseOutcome};

/// Wall clock truncated to what the wire carries, so locks compare equal
/// after a round trip.
pub fn wall_clock_ms() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[derive(Debug, Clone)]
struct HeldLock {
    lock: ChunkLock,
    since: Instant,
}

/// At most one lock per chunk. Expiry runs on the monotonic clock; the
/// wall clock in [`ChunkLock`] is informational.
#[derive(Debug)]
pub struct LockTable {
    locks: BTreeMap<ChunkCoordinate, HeldLock>,
    ttl: Duration,
}

impl LockTable {
    pub fn new(ttl: Duration) -> LockTable {
        LockTable { locks: BTreeMap::new(), ttl }
    }

    fn is_expired(&self, held: &HeldLock, now: Instant) -> bool {
        now.saturating_duration_since(held.since) >= self.ttl
    }

    /// Grants when the chunk is free, the old lock expired, or the holder
    /// re-acquires (which restarts the ttl). Otherwise returns the holder.
    pub fn acquire(&mut self, holder: PeerId, coordinate: ChunkCoordinate, now: Instant) -> Result<ChunkLock, PeerId> {
        if let Some(held) = self.locks.get(&coordinate) {
            if held.lock.holder != holder && !self.is_expired(held, now) {
                return Err(held.lock.holder);
            }
        }
        let lock = ChunkLock {
            coordinate,
            holder,
            acquired_at: wall_clock_ms(),
            ttl: self.ttl,
        };
        self.locks.insert(coordinate, HeldLock { lock: lock.clone(), since: now });
        Ok(lock)
    }

    pub fn release(&mut self, holder: PeerId, coordinate: ChunkCoordinate) -> ReleaseOutcome {
        match self.locks.get(&coordinate) {
            Some(held) if held.lock.holder == holder => {
                self.locks.remove(&coordinate);
                ReleaseOutcome::Released
            }
            _ => ReleaseOutcome::NotHolder,
        }
    }

    pub fn holder_of(&self, coordinate: &ChunkCoordinate, now: Instant) -> Option<PeerId> {
        self.locks.get(coordinate)
            .filter(|held| !self.is_expired(held, now))
            .map(|held| held.lock.holder)
    }

    pub fn is_held_by(&self, holder: &PeerId, coordinate: &ChunkCoordinate, now: Instant) -> bool {
        self.holder_of(coordinate, now).as_ref() == Some(holder)
    }

    pub fn sweep(&mut self, now: Instant) -> Vec<ChunkLock> {
        let expired: Vec<ChunkCoordinate> = self.locks.iter()
            .filter(|(_, held)| self.is_expired(held, now))
            .map(|(coordinate, _)| *coordinate)
            .collect();
        expired.iter().filter_map(|c| self.locks.remove(c)).map(|held| held.lock).collect()
    }

    pub fn release_all(&mut self, holder: &PeerId) -> Vec<ChunkLock> {
        let owned: Vec<ChunkCoordinate> = self.locks.iter()
            .filter(|(_, held)| held.lock.holder == *holder)
            .map(|(coordinate, _)| *coordinate)
            .collect();
        owned.iter().filter_map(|c| self.locks.remove(c)).map(|held| held.lock).collect()
    }

    pub fn locks(&self) -> Vec<ChunkLock> {
        self.locks.values().map(|held| held.lock.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn second_peer_is_denied_until_release() {
        let mut table = LockTable::new(TTL);
        let now = Instant::now();
        let (a, b) = (PeerId::new(), PeerId::new());
        let c = ChunkCoordinate::new(2, 3);

        assert_eq!(table.acquire(a, c, now).unwrap().holder, a);
        assert_eq!(table.acquire(b, c, now), Err(a));
        assert_eq!(table.release(b, c), ReleaseOutcome::NotHolder);
        assert_eq!(table.release(a, c), ReleaseOutcome::Released);
        assert_eq!(table.release(a, c), ReleaseOutcome::NotHolder);
        assert_eq!(table.acquire(b, c, now).unwrap().holder, b);
    }

    #[test]
    fn reacquire_restarts_the_ttl() {
        let mut table = LockTable::new(TTL);
        let start = Instant::now();
        let (a, b) = (PeerId::new(), PeerId::new());
        let c = ChunkCoordinate::new(0, 0);

        table.acquire(a, c, start).unwrap();
        table.acquire(a, c, start + Duration::from_secs(200)).unwrap();
        assert_eq!(table.acquire(b, c, start + Duration::from_secs(350)), Err(a));
        assert_eq!(table.holder_of(&c, start + Duration::from_secs(499)), Some(a));
        assert_eq!(table.holder_of(&c, start + Duration::from_secs(500)), None);
        assert_eq!(table.acquire(b, c, start + Duration::from_secs(500)).unwrap().holder, b);
    }

    #[test]
    fn sweep_removes_only_expired_locks() {
        let mut table = LockTable::new(TTL);
        let start = Instant::now();
        let a = PeerId::new();
        table.acquire(a, ChunkCoordinate::new(0, 0), start).unwrap();
        table.acquire(a, ChunkCoordinate::new(0, 1), start + Duration::from_secs(100)).unwrap();

        let expired = table.sweep(start + Duration::from_secs(300));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].coordinate, ChunkCoordinate::new(0, 0));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn release_all_only_touches_one_holder() {
        let mut table = LockTable::new(TTL);
        let now = Instant::now();
        let (a, b) = (PeerId::new(), PeerId::new());
        table.acquire(a, ChunkCoordinate::new(0, 0), now).unwrap();
        table.acquire(a, ChunkCoordinate::new(1, 0), now).unwrap();
        table.acquire(b, ChunkCoordinate::new(2, 0), now).unwrap();

        assert_eq!(table.release_all(&a).len(), 2);
        assert_eq!(table.locks().len(), 1);
        assert!(table.is_held_by(&b, &ChunkCoordinate::new(2, 0), now));
    }

    #[test]
    fn acquired_at_has_millisecond_precision() {
        let mut table = LockTable::new(TTL);
        let lock = table.acquire(PeerId::new(), ChunkCoordinate::new(0, 0), Instant::now()).unwrap();
        assert_eq!(lock.acquired_at.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
