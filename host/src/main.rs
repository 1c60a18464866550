use std::{net::{IpAddr, Ipv4Addr, SocketAddr}, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use console_cmd::{ConsoleCmd, HELP};
use console_input::console_input_thread;
use discovery::{detect_local_ip, mdns::register_mdns, Announcer};
use host::{chunk_store::load_states, HostServer, JsonChunkStore, SessionHost};
use msgs::{
    beacon::Beacon,
    config::{LanConfig, Role},
    logging::{init_logging, Verbosity},
    peer::{PeerId, PeerInfo},
    server_client_msg::{LockDenial, LockOutcome, ReleaseOutcome, UpdateOutcome},
};
use tracing::{error, info, warn};

mod console_cmd;
mod console_input;

#[derive(Parser, Debug)]
#[command(name = "mapart-host", about = "Host a LAN chunk-sync session")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override lan_port
    #[arg(long)]
    port: Option<u16>,

    /// Where beacons are sent (default: broadcast on lan_discovery_port)
    #[arg(long)]
    beacon_target: Option<SocketAddr>,

    /// Chunk rows in the map grid
    #[arg(long, default_value_t = 8)]
    rows: u16,

    /// Chunk columns in the map grid
    #[arg(long, default_value_t = 8)]
    columns: u16,

    /// Start even when lan_enabled or lan_host_mode say otherwise
    #[arg(long)]
    force: bool,
}

fn run_console_cmd(host: &SessionHost, cmd: ConsoleCmd, store: &mut JsonChunkStore) -> anyhow::Result<bool> {
    let me = host.local_peer().peer_id;
    match cmd {
        ConsoleCmd::Lock (c) => match host.request_lock(me, c) {
            LockOutcome::Granted (lock) => println!("locked {} until {}", c.reference(), lock.expires_at()),
            LockOutcome::Denied (LockDenial::AlreadyLocked (holder)) => println!("{} is locked by {}", c.reference(), holder.short()),
            LockOutcome::Denied (LockDenial::UnknownChunk) => println!("{} is not on the map", c.reference()),
        },
        ConsoleCmd::Release (c) => match host.release_lock(me, c) {
            ReleaseOutcome::Released => println!("released {}", c.reference()),
            ReleaseOutcome::NotHolder => println!("you do not hold {}", c.reference()),
        },
        ConsoleCmd::Set (c, status) => {
            let Some(current) = host.chunk(&c) else {
                println!("{} is not on the map", c.reference());
                return Ok(true);
            };
            match host.submit_update(me, c, status, current.version) {
                UpdateOutcome::Accepted { version } => println!("{} is now {status} (v{version})", c.reference()),
                UpdateOutcome::NotLockHolder { .. } => println!("lock {} first", c.reference()),
                UpdateOutcome::Rejected { current } => println!("{} changed meanwhile, now v{}", c.reference(), current.version),
                UpdateOutcome::UnknownChunk => println!("{} is not on the map", c.reference()),
            }
        }
        ConsoleCmd::Show (Some(c)) => match host.chunk(&c) {
            Some(chunk) => println!("{} {} v{}", c.reference(), chunk.status, chunk.version),
            None => println!("{} is not on the map", c.reference()),
        },
        ConsoleCmd::Show (None) => {
            for chunk in host.chunks() {
                println!("{:>5} {:<8} v{}", chunk.coordinate.reference(), chunk.status, chunk.version);
            }
        }
        ConsoleCmd::Peers => {
            for peer in host.peers() {
                let role = if peer.is_host { "host" } else { "peer" };
                println!("{} {} {} ({role})", peer.peer_id.short(), peer.display_name, peer.address);
            }
        }
        ConsoleCmd::Locks => {
            for lock in host.snapshot().locks {
                println!("{} held by {} since {}", lock.coordinate.reference(), lock.holder.short(), lock.acquired_at);
            }
        }
        ConsoleCmd::History (limit) => {
            let history = host.history(limit);
            if history.is_empty() {
                println!("no edits yet");
            }
            for record in history {
                println!(
                    "{} {:>5} {} -> {} v{} by {}",
                    record.at.format("%H:%M:%S"),
                    record.coordinate.reference(),
                    record.previous,
                    record.status,
                    record.version,
                    record.author.short(),
                );
            }
        }
        ConsoleCmd::Status => {
            let summary = host.summary();
            println!("revision {}, {} peers, {} locks", summary.revision, summary.peers, summary.locks);
            println!("{} complete, {} partial, {} empty", summary.complete, summary.partial, summary.empty);
            if summary.pending > 0 || summary.lagging > 0 {
                println!("{} edits waiting to go out, {} peers behind", summary.pending, summary.lagging);
            }
        }
        ConsoleCmd::Save => {
            let count = host.checkpoint(store)?;
            println!("saved {count} chunks to {}", store.path().display());
        }
        ConsoleCmd::Flush => println!("sent {} batches", host.flush_broadcasts()),
        ConsoleCmd::Help => println!("{HELP}"),
        ConsoleCmd::Quit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(Verbosity::from_occurrences(args.verbose));

    let config = LanConfig::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?;
    if !args.force {
        config.check_role(Role::Host).with_context(|| format!("{} (pass --force to start anyway)", args.config.display()))?;
    }
    let timings = config.timings()?;
    let port = args.port.unwrap_or(config.lan_port);

    let mut store = JsonChunkStore::open(&config.progress_file, args.rows, args.columns)?;
    let states = load_states(&store)?;

    let server = HostServer::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
        .await
        .with_context(|| format!("could not bind port {port}"))?;
    let port = server.local_addr()?.port();

    let ip = detect_local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let local = PeerInfo {
        peer_id: PeerId::new(),
        display_name: config.display_name(),
        address: SocketAddr::new(ip, port),
        is_host: true,
    };
    let beacon = Beacon {
        peer_id: local.peer_id,
        display_name: local.display_name.clone(),
        address: ip,
        port,
    };

    let host = Arc::new(SessionHost::new(local, timings.clone(), states));
    info!("hosting {} chunks as {} at {ip}:{port}", host.chunks().len(), host.local_peer().display_name);

    tokio::spawn(server.serve(host.clone()));
    let _timers = host.spawn_timers();

    let target = args.beacon_target
        .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), config.lan_discovery_port));
    match Announcer::bind(&beacon, target, timings.beacon_interval).await {
        Ok(announcer) => {
            tokio::spawn(announcer.run());
        }
        Err(e) => warn!("beacons disabled, peers must connect by address: {e}"),
    }

    let mdns = if config.lan_mdns {
        match register_mdns(&beacon) {
            Ok(daemon) => Some(daemon),
            Err(e) => {
                warn!("mdns disabled: {e:#}");
                None
            }
        }
    }
    else {
        None
    };

    println!("{HELP}");
    let mut console_receiver = console_input_thread();
    loop {
        tokio::select! {
            line = console_receiver.recv() => {
                let Some(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match ConsoleCmd::parse(line) {
                    Ok(cmd) => match run_console_cmd(&host, cmd, &mut store) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => println!("err: {e:#}"),
                    },
                    Err(err) => println!("err: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = host.checkpoint(&mut store) {
        error!("failed to save progress: {e:#}");
    }
    host.shutdown();
    // give connection processes a moment to deliver the shutdown notice
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    if let Some(daemon) = mdns {
        let _ = daemon.shutdown();
    }
    Ok(())
}
