use std::{net::SocketAddr, sync::Arc, time::{Duration, Instant}};

use msgs::{beacon::Beacon, error::SyncError, peer::{PeerId, PeerInfo}};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::peer_directory::{BeaconOutcome, PeerDirectory};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    HostDiscovered (PeerInfo),
    HostLost (PeerInfo),
    ConflictIgnored {
        address: SocketAddr,
        known: PeerId,
        ignored: PeerId,
    },
}

pub fn prune_interval(liveness_timeout: Duration) -> Duration {
    (liveness_timeout / 4).max(Duration::from_millis(100))
}

pub struct DiscoveryService {
    directory: Arc<RwLock<PeerDirectory>>,
    tx: broadcast::Sender<DiscoveryEvent>,
    own_id: PeerId,
    liveness_timeout: Duration,
}

impl DiscoveryService {
    pub fn new(own_id: PeerId, liveness_timeout: Duration) -> DiscoveryService {
        let (tx, _) = broadcast::channel(100);
        DiscoveryService {
            directory: Arc::new(RwLock::new(PeerDirectory::new())),
            tx,
            own_id,
            liveness_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.tx.subscribe()
    }

    pub fn directory(&self) -> Arc<RwLock<PeerDirectory>> {
        self.directory.clone()
    }

    pub fn hosts(&self) -> Vec<PeerInfo> {
        self.directory.read().hosts()
    }

    pub fn bind_host(&self, peer_id: PeerId) -> bool {
        self.directory.write().bind_host(peer_id)
    }

    pub fn bound_host(&self) -> Option<PeerInfo> {
        self.directory.read().bound_host().cloned()
    }

    pub fn apply_beacon(&self, beacon: &Beacon, now: Instant) {
        if beacon.peer_id == self.own_id {
            return;
        }
        let outcome = self.directory.write().observe_beacon(beacon, now);
        // events go out after the directory lock is released
        match outcome {
            BeaconOutcome::Discovered (info) => {
                info!(peer = %info.peer_id.short(), "discovered host {} at {}", info.display_name, info.address);
                let _ = self.tx.send(DiscoveryEvent::HostDiscovered (info));
            }
            BeaconOutcome::Refreshed => {}
            BeaconOutcome::Conflict { known } => {
                warn!(
                    peer = %beacon.peer_id.short(),
                    "ignoring beacon for {}, address already claimed by {}", beacon.service_addr(), known.short()
                );
                let _ = self.tx.send(DiscoveryEvent::ConflictIgnored {
                    address: beacon.service_addr(),
                    known,
                    ignored: beacon.peer_id,
                });
            }
        }
    }

    pub fn prune(&self, now: Instant) -> Vec<PeerInfo> {
        let removed = self.directory.write().prune(now, self.liveness_timeout);
        for info in &removed {
            if info.is_host {
                warn!(peer = %info.peer_id.short(), "host {} at {} went silent", info.display_name, info.address);
                let _ = self.tx.send(DiscoveryEvent::HostLost (info.clone()));
            }
        }
        removed
    }

    /// Resolves with the first known host, waiting up to `timeout`.
    pub async fn wait_for_host(&self, timeout: Duration) -> Result<PeerInfo, SyncError> {
        let mut rx = self.subscribe();
        if let Some(host) = self.hosts().into_iter().next() {
            return Ok(host);
        }
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(DiscoveryEvent::HostDiscovered (info)) => return Some(info),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged (_)) => {
                        if let Some(host) = self.hosts().into_iter().next() {
                            return Some(host);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(host)) => Ok(host),
            _ => Err(SyncError::NetworkUnreachable {
                address: "lan".into(),
                reason: format!("no host announced itself within {timeout:?}"),
            }),
        }
    }

    /// Applies incoming beacons and prunes on a timer. Keeps pruning after
    /// every beacon source is gone so silent hosts are still reported lost.
    pub async fn run(self: Arc<Self>, mut beacons: mpsc::Receiver<Beacon>) {
        let mut ticker = tokio::time::interval(prune_interval(self.liveness_timeout));
        let mut sources_open = true;
        loop {
            tokio::select! {
                beacon = beacons.recv(), if sources_open => {
                    match beacon {
                        Some(beacon) => self.apply_beacon(&beacon, Instant::now()),
                        None => sources_open = false,
                    }
                }
                _ = ticker.tick() => {
                    self.prune(Instant::now());
                }
            }
        }
    }
}
