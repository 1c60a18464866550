use std::{net::{IpAddr, Ipv4Addr, SocketAddr}, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use client::{ClientIdentity, SessionClient, SessionEvent};
use console_cmd::{ConsoleCmd, HELP};
use console_input::console_input_thread;
use discovery::{mdns::browse_mdns, BeaconListener, DiscoveryEvent, DiscoveryService};
use msgs::{
    chunk::CompletionStatus,
    config::{LanConfig, Role},
    error::SyncError,
    logging::{init_logging, Verbosity},
    peer::PeerId,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

mod console_cmd;
mod console_input;

#[derive(Parser, Debug)]
#[command(name = "mapart-client", about = "Join a LAN chunk-sync session")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Connect to this host instead of waiting for a beacon
    #[arg(long)]
    host: Option<SocketAddr>,

    /// Name shown to other players
    #[arg(long)]
    name: Option<String>,

    /// Seconds to wait for a host to announce itself
    #[arg(long, default_value_t = 10)]
    discovery_timeout: u64,

    /// Start even when lan_enabled or lan_host_mode say otherwise
    #[arg(long)]
    force: bool,
}

async fn run_console_cmd(session: &SessionClient, discovery: Option<&DiscoveryService>, cmd: ConsoleCmd) -> anyhow::Result<bool> {
    match cmd {
        ConsoleCmd::Lock (c) => {
            let lock = session.begin_edit(c).await?;
            println!("locked {} until {}", c.reference(), lock.expires_at());
        }
        ConsoleCmd::Release (c) => {
            session.end_edit(c).await?;
            println!("released {}", c.reference());
        }
        ConsoleCmd::Set (c, status) => {
            let version = session.apply_edit(c, status).await?;
            println!("{} is now {status} (v{version})", c.reference());
        }
        ConsoleCmd::Mark (c, status) => mark(session, c, status).await?,
        ConsoleCmd::Show (Some(c)) => match session.chunk(&c) {
            Some(chunk) => println!("{} {} v{}", c.reference(), chunk.status, chunk.version),
            None => println!("{} is not on the map", c.reference()),
        },
        ConsoleCmd::Show (None) => {
            for chunk in session.chunks() {
                println!("{:>5} {:<8} v{}", chunk.coordinate.reference(), chunk.status, chunk.version);
            }
            println!("revision {}", session.revision());
        }
        ConsoleCmd::Peers => {
            for peer in session.peers() {
                let me = if peer.peer_id == session.peer_id() { " (you)" } else { "" };
                let role = if peer.is_host { "host" } else { "peer" };
                println!("{} {} {} ({role}){me}", peer.peer_id.short(), peer.display_name, peer.address);
            }
        }
        ConsoleCmd::Locks => {
            for lock in session.locks() {
                println!("{} held by {} since {}", lock.coordinate.reference(), lock.holder.short(), lock.acquired_at);
            }
        }
        ConsoleCmd::Held => {
            let held: Vec<String> = session.held_locks().iter().map(|c| c.reference()).collect();
            println!("holding: {}", if held.is_empty() { "nothing".to_string() } else { held.join(", ") });
        }
        ConsoleCmd::Hosts => match discovery {
            Some(discovery) => {
                for host in discovery.hosts() {
                    println!("{} {} {}", host.peer_id.short(), host.display_name, host.address);
                }
            }
            None => println!("connected directly to {}", session.host_addr()),
        },
        ConsoleCmd::Resync => session.resync().await?,
        ConsoleCmd::Help => println!("{HELP}"),
        ConsoleCmd::Quit => return Ok(false),
    }
    Ok(true)
}

async fn mark(session: &SessionClient, c: msgs::chunk::ChunkCoordinate, status: CompletionStatus) -> anyhow::Result<()> {
    session.begin_edit(c).await?;
    let edited = session.apply_edit(c, status).await;
    let released = session.end_edit(c).await;
    let version = edited?;
    released?;
    println!("{} is now {status} (v{version})", c.reference());
    Ok(())
}

fn print_event(event: &SessionEvent, me: PeerId) {
    match event {
        SessionEvent::Delta (delta) if delta.modified_by != me => {
            println!("{} marked {} by {}", delta.coordinate.reference(), delta.status, delta.modified_by.short())
        }
        SessionEvent::PeerJoined (peer) => println!("{} joined", peer.display_name),
        SessionEvent::PeerLeft (peer_id) => println!("{} left", peer_id.short()),
        SessionEvent::EditRejected { current } => {
            println!("{} was changed by someone else, now {} v{}", current.coordinate.reference(), current.status, current.version)
        }
        SessionEvent::Resynced { revision } => println!("resynced at revision {revision}"),
        _ => {}
    }
}

/// Conflicts are part of normal play and get a gentler message.
fn describe_failure(e: &anyhow::Error) -> String {
    match e.downcast_ref::<SyncError>() {
        Some(sync) if sync.is_conflict() => format!("busy: {sync}, try again"),
        _ => format!("err: {e:#}"),
    }
}

fn lost_our_host(event: &DiscoveryEvent, host_addr: SocketAddr) -> bool {
    matches!(event, DiscoveryEvent::HostLost (host) if host.address == host_addr)
}

async fn next_discovery_event(rx: &mut Option<broadcast::Receiver<DiscoveryEvent>>) -> DiscoveryEvent {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(event) => return event,
            Err(broadcast::error::RecvError::Lagged (_)) => {}
            Err(broadcast::error::RecvError::Closed) => *rx = None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(Verbosity::from_occurrences(args.verbose));

    let config = LanConfig::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?;
    if !args.force {
        config.check_role(Role::Client).with_context(|| format!("{} (pass --force to start anyway)", args.config.display()))?;
    }
    let timings = config.timings()?;
    let identity = ClientIdentity {
        peer_id: PeerId::new(),
        display_name: args.name.clone().unwrap_or_else(|| config.display_name()),
    };

    let mut discovery = None;
    let mut mdns = None;
    let host_addr = match args.host {
        Some(addr) => addr,
        None => {
            let service = Arc::new(DiscoveryService::new(identity.peer_id, timings.peer_liveness_timeout));
            let (tx, rx) = mpsc::channel(64);

            let listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.lan_discovery_port);
            let listener = BeaconListener::bind(listen_addr, identity.peer_id)
                .await
                .with_context(|| format!("could not listen for beacons on {listen_addr}"))?;
            tokio::spawn(listener.run(tx.clone()));

            if config.lan_mdns {
                match browse_mdns(identity.peer_id, tx.clone(), timings.beacon_interval) {
                    Ok(daemon) => mdns = Some(daemon),
                    Err(e) => warn!("mdns browsing disabled: {e:#}"),
                }
            }
            drop(tx);
            tokio::spawn(service.clone().run(rx));

            println!("looking for a host...");
            let host = service.wait_for_host(Duration::from_secs(args.discovery_timeout)).await?;
            service.bind_host(host.peer_id);
            info!("found host {} at {}", host.display_name, host.address);
            discovery = Some(service);
            host.address
        }
    };

    let session = SessionClient::connect(host_addr, identity, &timings).await?;
    println!("joined as {} with {} chunks", session.identity().display_name, session.chunks().len());
    println!("{HELP}");

    let mut session_events = session.events();
    let mut discovery_events = discovery.as_ref().map(|d| d.subscribe());
    let mut console_receiver = console_input_thread();
    loop {
        tokio::select! {
            line = console_receiver.recv() => {
                let Some(line) = line else { break };
                match ConsoleCmd::parse(&line) {
                    Ok(cmd) => match run_console_cmd(&session, discovery.as_deref(), cmd).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => println!("{}", describe_failure(&e)),
                    },
                    Err(err) => println!("err: {err}"),
                }
            }
            event = session_events.recv() => {
                match event {
                    Ok(SessionEvent::HostLost) | Err(broadcast::error::RecvError::Closed) => {
                        println!("lost the connection to the host");
                        break;
                    }
                    Ok(event) => print_event(&event, session.peer_id()),
                    Err(broadcast::error::RecvError::Lagged (missed)) => warn!(missed, "missed session events"),
                }
            }
            event = next_discovery_event(&mut discovery_events) => {
                if lost_our_host(&event, host_addr) {
                    warn!("host at {host_addr} stopped announcing itself");
                    println!("the host went away");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if !session.is_closed() {
        session.disconnect().await;
    }
    if let Some(daemon) = mdns {
        let _ = daemon.shutdown();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use msgs::{chunk::ChunkCoordinate, peer::PeerInfo};

    use super::*;

    fn host_at(address: &str) -> PeerInfo {
        PeerInfo { peer_id: PeerId::new(), display_name: "host".into(), address: address.parse().unwrap(), is_host: true }
    }

    #[test]
    fn only_losing_the_joined_host_ends_the_session() {
        let joined: SocketAddr = "192.168.1.20:8080".parse().unwrap();
        assert!(lost_our_host(&DiscoveryEvent::HostLost (host_at("192.168.1.20:8080")), joined));
        assert!(!lost_our_host(&DiscoveryEvent::HostLost (host_at("192.168.1.21:8080")), joined));
        assert!(!lost_our_host(&DiscoveryEvent::HostDiscovered (host_at("192.168.1.20:8080")), joined));
    }

    #[test]
    fn conflicts_read_as_retryable() {
        let c = ChunkCoordinate::new(2, 3);
        let conflict = anyhow::Error::from(SyncError::LockConflict { coordinate: c, holder: PeerId::new() });
        assert!(describe_failure(&conflict).starts_with("busy: "));

        let closed = anyhow::Error::from(SyncError::SessionClosed);
        assert_eq!(describe_failure(&closed), "err: session closed");
    }
}
