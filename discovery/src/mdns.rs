use std::{collections::HashMap, net::IpAddr, time::{Duration, Instant}};

use anyhow::Context;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use msgs::{beacon::Beacon, peer::PeerId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const SERVICE_TYPE: &str = "_mapart-sync._tcp.local.";

fn service_info(beacon: &Beacon) -> anyhow::Result<ServiceInfo> {
    let instance_name = format!("mapart-{}", beacon.peer_id.short());
    let host_name = format!("{}.local.", beacon.address);
    let peer_id = beacon.peer_id.to_string();
    let properties = [("peer_id", peer_id.as_str()), ("display_name", beacon.display_name.as_str())];

    let service = ServiceInfo::new(
        SERVICE_TYPE,
        &instance_name,
        &host_name,
        beacon.address,
        beacon.port,
        &properties[..],
    ).context("invalid mdns service info")?;
    Ok(service)
}

/// Advertises the host over mDNS next to the UDP beacon.
pub fn register_mdns(beacon: &Beacon) -> anyhow::Result<ServiceDaemon> {
    let service = service_info(beacon)?;
    let mdns = ServiceDaemon::new().context("failed to create mdns daemon")?;
    let fullname = service.get_fullname().to_string();
    mdns.register(service).context("failed to register mdns service")?;
    info!("registered {fullname}");
    Ok(mdns)
}

fn beacon_from_service(info: &ServiceInfo) -> Option<Beacon> {
    let peer_id: PeerId = info.get_property_val_str("peer_id")?.parse().ok()?;
    let display_name = info.get_property_val_str("display_name").unwrap_or("host").to_string();
    let addresses = info.get_addresses();
    let address: IpAddr = addresses.iter().find(|ip| ip.is_ipv4()).or_else(|| addresses.iter().next()).copied()?;
    Some(Beacon { peer_id, display_name, address, port: info.get_port() })
}

/// Browses for hosts on a background thread and feeds them into `tx` as
/// beacons. Resolved services are re-sent every `reemit` until removed, so
/// the directory keeps them alive the same way it does UDP beacons.
pub fn browse_mdns(own_id: PeerId, tx: mpsc::Sender<Beacon>, reemit: Duration) -> anyhow::Result<ServiceDaemon> {
    let mdns = ServiceDaemon::new().context("failed to create mdns daemon")?;
    let receiver = mdns.browse(SERVICE_TYPE).context("failed to browse for services")?;

    std::thread::spawn(move || {
        let mut resolved: HashMap<String, Beacon> = HashMap::new();
        let mut last_emit = Instant::now();

        loop {
            match receiver.recv_timeout(reemit) {
                Ok(ServiceEvent::ServiceResolved (info)) => {
                    let Some(beacon) = beacon_from_service(&info) else {
                        warn!("ignoring mdns service {} without a peer id", info.get_fullname());
                        continue;
                    };
                    if beacon.peer_id == own_id {
                        continue;
                    }
                    debug!(peer = %beacon.peer_id.short(), "mdns resolved {}", beacon.service_addr());
                    if tx.blocking_send(beacon.clone()).is_err() {
                        return;
                    }
                    resolved.insert(info.get_fullname().to_string(), beacon);
                }
                Ok(ServiceEvent::ServiceRemoved (_, fullname)) => {
                    resolved.remove(&fullname);
                }
                Ok(_) => {}
                Err(_) if receiver.is_disconnected() => return,
                Err(_) => {}
            }

            if last_emit.elapsed() >= reemit {
                last_emit = Instant::now();
                for beacon in resolved.values() {
                    if tx.blocking_send(beacon.clone()).is_err() {
                        return;
                    }
                }
            }
        }
    });

    Ok(mdns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon() -> Beacon {
        Beacon {
            peer_id: PeerId::new(),
            display_name: "upstairs".into(),
            address: "192.168.1.20".parse().unwrap(),
            port: 8080,
        }
    }

    #[test]
    fn advertised_service_resolves_to_the_same_beacon() {
        let beacon = beacon();
        let info = service_info(&beacon).unwrap();
        assert_eq!(info.get_type(), SERVICE_TYPE);
        assert_eq!(info.get_port(), 8080);
        assert!(info.get_fullname().starts_with(&format!("mapart-{}", beacon.peer_id.short())));
        assert_eq!(beacon_from_service(&info), Some(beacon));
    }

    #[test]
    fn services_without_a_usable_peer_id_are_skipped() {
        let anonymous = ServiceInfo::new(SERVICE_TYPE, "stranger", "stranger.local.", "192.168.1.30", 8080, &[("display_name", "x")][..]).unwrap();
        assert_eq!(beacon_from_service(&anonymous), None);

        let garbled = ServiceInfo::new(SERVICE_TYPE, "garbled", "garbled.local.", "192.168.1.31", 8080, &[("peer_id", "not-an-id")][..]).unwrap();
        assert_eq!(beacon_from_service(&garbled), None);
    }
}
