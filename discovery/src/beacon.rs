use std::{io, net::{IpAddr, Ipv4Addr, SocketAddr}, time::Duration};

use msgs::{beacon::Beacon, peer::PeerId};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, info, warn};

pub fn detect_local_ip() -> Option<IpAddr> {
    match local_ip_address::local_ip() {
        Ok(ip) => Some(ip),
        Err(e) => {
            warn!("could not detect local ip: {e}");
            None
        }
    }
}

/// Private, loopback and link-local ranges. Beacons from anywhere else are
/// not from our LAN.
pub fn is_lan_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        IpAddr::V6(ip) => {
            let first = ip.segments()[0];
            ip.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Host side: broadcasts the beacon on a fixed interval.
pub struct Announcer {
    socket: UdpSocket,
    target: SocketAddr,
    datagram: Vec<u8>,
    interval: Duration,
}

impl Announcer {
    pub async fn bind(beacon: &Beacon, target: SocketAddr, interval: Duration) -> io::Result<Announcer> {
        let bind_addr = match target {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => "[::]:0".parse().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        let datagram = beacon.to_datagram()?;
        info!("announcing {} on {target} every {interval:?}", beacon.service_addr());
        Ok(Announcer { socket, target, datagram, interval })
    }

    pub async fn announce_once(&self) -> io::Result<()> {
        self.socket.send_to(&self.datagram, self.target).await?;
        Ok(())
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.announce_once().await {
                warn!("beacon send to {} failed: {e}", self.target);
            }
        }
    }
}

/// Client side: receives beacons on the discovery port.
pub struct BeaconListener {
    socket: UdpSocket,
    own_id: PeerId,
}

impl BeaconListener {
    pub async fn bind(addr: SocketAddr, own_id: PeerId) -> io::Result<BeaconListener> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(BeaconListener { socket, own_id })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the next beacon from another peer. Garbage is logged and skipped.
    pub async fn recv(&self) -> io::Result<Beacon> {
        let mut buffer = [0u8; 2048];
        loop {
            let (n, source) = self.socket.recv_from(&mut buffer).await?;
            if !is_lan_address(&source.ip()) {
                warn!("ignoring datagram from non-local address {source}");
                continue;
            }
            let mut beacon = match Beacon::decode_datagram(&buffer[..n]) {
                Ok(beacon) => beacon,
                Err(e) => {
                    warn!("malformed beacon from {source}: {e}");
                    continue;
                }
            };
            if beacon.peer_id == self.own_id {
                continue;
            }
            // hosts that could not detect their own ip announce 0.0.0.0
            if beacon.address.is_unspecified() {
                beacon.address = source.ip();
            }
            debug!(peer = %beacon.peer_id.short(), "beacon from {}", beacon.service_addr());
            return Ok(beacon);
        }
    }

    /// Forwards beacons until the receiving side goes away.
    pub async fn run(self, tx: mpsc::Sender<Beacon>) {
        loop {
            match self.recv().await {
                Ok(beacon) => {
                    if tx.send(beacon).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("beacon listener error: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lan_ranges() {
        for ip in ["192.168.1.4", "10.0.0.1", "172.16.5.5", "127.0.0.1", "169.254.3.3", "::1", "fe80::1", "fd00::5"] {
            assert!(is_lan_address(&ip.parse().unwrap()), "{ip}");
        }
        for ip in ["8.8.8.8", "172.32.0.1", "2001:db8::1"] {
            assert!(!is_lan_address(&ip.parse().unwrap()), "{ip}");
        }
    }

    #[tokio::test]
    async fn listener_skips_garbage_and_own_beacons() {
        let own_id = PeerId::new();
        let listener = BeaconListener::bind("127.0.0.1:0".parse().unwrap(), own_id).await.unwrap();
        let target = listener.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"not a beacon", target).await.unwrap();

        let own = Beacon { peer_id: own_id, display_name: "me".into(), address: "127.0.0.1".parse().unwrap(), port: 1 };
        sender.send_to(&own.to_datagram().unwrap(), target).await.unwrap();

        let other = Beacon { peer_id: PeerId::new(), display_name: "host".into(), address: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port: 8080 };
        let announcer = Announcer::bind(&other, target, Duration::from_secs(60)).await.unwrap();
        announcer.announce_once().await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), listener.recv()).await.unwrap().unwrap();
        assert_eq!(received.peer_id, other.peer_id);
        assert_eq!(received.service_addr(), "127.0.0.1:8080".parse().unwrap());
    }
}
