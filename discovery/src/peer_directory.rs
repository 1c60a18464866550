use std::{collections::HashMap, time::{Duration, Instant}};

use msgs::{beacon::Beacon, peer::{PeerId, PeerInfo}};

#[derive(Debug, Clone)]
struct DirectoryEntry {
    info: PeerInfo,
    last_seen: Instant,
    /// Never pruned. Used for the host's own participant.
    pinned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconOutcome {
    Discovered (PeerInfo),
    Refreshed,
    /// Another host already claimed this address; first seen wins.
    Conflict { known: PeerId },
}

/// Known participants, keyed by peer id, with last-seen bookkeeping.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    entries: HashMap<PeerId, DirectoryEntry>,
    bound_host: Option<PeerId>,
}

impl PeerDirectory {
    pub fn new() -> PeerDirectory {
        PeerDirectory::default()
    }

    /// Returns true when the peer was not known before.
    pub fn upsert(&mut self, info: PeerInfo, now: Instant) -> bool {
        match self.entries.get_mut(&info.peer_id) {
            Some(entry) => {
                entry.info = info;
                entry.last_seen = now;
                false
            }
            None => {
                self.entries.insert(info.peer_id, DirectoryEntry { info, last_seen: now, pinned: false });
                true
            }
        }
    }

    pub fn insert_pinned(&mut self, info: PeerInfo, now: Instant) {
        self.entries.insert(info.peer_id, DirectoryEntry { info, last_seen: now, pinned: true });
    }

    pub fn observe_beacon(&mut self, beacon: &Beacon, now: Instant) -> BeaconOutcome {
        let info = beacon.host_info();
        let claimed_by = self.entries.values()
            .find(|e| e.info.is_host && e.info.address == info.address && e.info.peer_id != info.peer_id)
            .map(|e| e.info.peer_id);
        if let Some(known) = claimed_by {
            return BeaconOutcome::Conflict { known };
        }
        if self.upsert(info.clone(), now) {
            BeaconOutcome::Discovered (info)
        }
        else {
            BeaconOutcome::Refreshed
        }
    }

    pub fn touch(&mut self, peer_id: &PeerId, now: Instant) -> bool {
        match self.entries.get_mut(peer_id) {
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        if self.bound_host.as_ref() == Some(peer_id) {
            self.bound_host = None;
        }
        self.entries.remove(peer_id).map(|e| e.info)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.entries.get(peer_id).map(|e| &e.info)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.entries.contains_key(peer_id)
    }

    pub fn last_seen(&self, peer_id: &PeerId) -> Option<Instant> {
        self.entries.get(peer_id).map(|e| e.last_seen)
    }

    pub fn hosts(&self) -> Vec<PeerInfo> {
        let mut hosts: Vec<PeerInfo> = self.entries.values()
            .filter(|e| e.info.is_host)
            .map(|e| e.info.clone())
            .collect();
        hosts.sort_by_key(|info| info.peer_id);
        hosts
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.entries.values().map(|e| e.info.clone()).collect();
        peers.sort_by_key(|info| info.peer_id);
        peers
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every unpinned entry silent for longer than `timeout`.
    pub fn prune(&mut self, now: Instant, timeout: Duration) -> Vec<PeerInfo> {
        let stale: Vec<PeerId> = self.entries.iter()
            .filter(|(_, e)| !e.pinned && now.saturating_duration_since(e.last_seen) > timeout)
            .map(|(peer_id, _)| *peer_id)
            .collect();

        let mut removed: Vec<PeerInfo> = stale.iter().filter_map(|peer_id| self.remove(peer_id)).collect();
        removed.sort_by_key(|info| info.peer_id);
        removed
    }

    /// Attaches to a known host. A later host never replaces the binding.
    pub fn bind_host(&mut self, peer_id: PeerId) -> bool {
        if self.bound_host.is_some() {
            return self.bound_host == Some(peer_id);
        }
        match self.entries.get(&peer_id) {
            Some(entry) if entry.info.is_host => {
                self.bound_host = Some(peer_id);
                true
            }
            _ => false,
        }
    }

    pub fn bound_host(&self) -> Option<&PeerInfo> {
        self.bound_host.as_ref().and_then(|peer_id| self.get(peer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(port: u16) -> Beacon {
        Beacon {
            peer_id: PeerId::new(),
            display_name: "host".into(),
            address: "192.168.1.20".parse().unwrap(),
            port,
        }
    }

    fn client(name: &str) -> PeerInfo {
        PeerInfo {
            peer_id: PeerId::new(),
            display_name: name.into(),
            address: "192.168.1.30:50000".parse().unwrap(),
            is_host: false,
        }
    }

    #[test]
    fn upsert_reports_new_entries_once() {
        let mut directory = PeerDirectory::new();
        let now = Instant::now();
        let info = client("alex");
        assert!(directory.upsert(info.clone(), now));
        assert!(!directory.upsert(info.clone(), now));
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.get(&info.peer_id), Some(&info));
    }

    #[test]
    fn prune_drops_silent_entries_but_keeps_pinned() {
        let mut directory = PeerDirectory::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(15);

        let local = PeerInfo { is_host: true, ..client("local") };
        directory.insert_pinned(local.clone(), start);
        let quiet = client("quiet");
        directory.upsert(quiet.clone(), start);
        let chatty = client("chatty");
        directory.upsert(chatty.clone(), start);

        directory.touch(&chatty.peer_id, start + Duration::from_secs(10));
        assert!(directory.prune(start + Duration::from_secs(15), timeout).is_empty());

        let removed = directory.prune(start + Duration::from_secs(16), timeout);
        assert_eq!(removed, vec![quiet.clone()]);
        assert!(directory.contains(&local.peer_id));
        assert!(directory.contains(&chatty.peer_id));

        let removed = directory.prune(start + Duration::from_secs(60), timeout);
        assert_eq!(removed, vec![chatty]);
        assert_eq!(directory.peers(), vec![local]);
    }

    #[test]
    fn first_host_on_an_address_wins() {
        let mut directory = PeerDirectory::new();
        let now = Instant::now();
        let first = beacon(8080);
        let impostor = Beacon { peer_id: PeerId::new(), ..first.clone() };

        assert_eq!(directory.observe_beacon(&first, now), BeaconOutcome::Discovered (first.host_info()));
        assert_eq!(directory.observe_beacon(&first, now), BeaconOutcome::Refreshed);
        assert_eq!(directory.observe_beacon(&impostor, now), BeaconOutcome::Conflict { known: first.peer_id });
        assert_eq!(directory.hosts(), vec![first.host_info()]);
    }

    #[test]
    fn binding_sticks_to_the_first_host() {
        let mut directory = PeerDirectory::new();
        let now = Instant::now();
        let first = beacon(8080);
        let second = beacon(9090);
        directory.observe_beacon(&first, now);
        directory.observe_beacon(&second, now);

        let plain = client("alex");
        directory.upsert(plain.clone(), now);
        assert!(!directory.bind_host(plain.peer_id));

        assert!(directory.bind_host(first.peer_id));
        assert!(!directory.bind_host(second.peer_id));
        assert_eq!(directory.bound_host().map(|h| h.peer_id), Some(first.peer_id));
        assert_eq!(directory.hosts().len(), 2);

        directory.remove(&first.peer_id);
        assert!(directory.bound_host().is_none());
    }
}
