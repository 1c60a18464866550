use std::{net::SocketAddr, sync::Arc, time::Duration};

use client::{ClientIdentity, SessionClient, SessionEvent};
use host::{chunk_store::load_states, HostServer, MemoryChunkStore, SessionHost};
use msgs::{
    chunk::{ChunkCoordinate, CompletionStatus},
    config::SessionTimings,
    error::SyncError,
    peer::{PeerId, PeerInfo},
};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

fn timings() -> SessionTimings {
    SessionTimings {
        sync_interval: None,
        ..SessionTimings::default()
    }
}

async fn start_host(timings: SessionTimings) -> (Arc<SessionHost>, SocketAddr) {
    let states = load_states(&MemoryChunkStore::with_grid(8, 8)).unwrap();
    let local = PeerInfo {
        peer_id: PeerId::new(),
        display_name: "host".into(),
        address: "127.0.0.1:0".parse().unwrap(),
        is_host: true,
    };
    let host = Arc::new(SessionHost::new(local, timings, states));
    let server = HostServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve(host.clone()));
    (host, addr)
}

async fn join(addr: SocketAddr, name: &str, timings: &SessionTimings) -> SessionClient {
    SessionClient::connect(addr, ClientIdentity::new(name), timings).await.unwrap()
}

async fn wait_for(rx: &mut broadcast::Receiver<SessionEvent>, wanted: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged (_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("session dropped"),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

#[tokio::test]
async fn joining_mirrors_the_host() {
    let (host, addr) = start_host(timings()).await;
    let a = join(addr, "a", &timings()).await;

    assert_eq!(a.chunks().len(), 64);
    assert_eq!(a.revision(), host.revision());
    assert!(a.peers().iter().any(|p| p.is_host && p.peer_id == host.local_peer().peer_id));
    assert!(a.peers().iter().any(|p| p.peer_id == a.peer_id()));
}

#[tokio::test]
async fn reusing_a_peer_id_is_rejected() {
    let (_host, addr) = start_host(timings()).await;
    let identity = ClientIdentity::new("a");
    let _a = SessionClient::connect(addr, identity.clone(), &timings()).await.unwrap();

    match SessionClient::connect(addr, identity.clone(), &timings()).await {
        Err(SyncError::DuplicatePeer (id)) => assert_eq!(id, identity.peer_id),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("duplicate peer was accepted"),
    }
}

#[tokio::test]
async fn second_editor_of_a_chunk_is_told_who_holds_it() {
    let (host, addr) = start_host(timings()).await;
    let a = join(addr, "a", &timings()).await;
    let b = join(addr, "b", &timings()).await;
    let mut b_events = b.events();
    let c = ChunkCoordinate::new(2, 3);

    a.begin_edit(c).await.unwrap();
    match b.begin_edit(c).await {
        Err(SyncError::LockConflict { coordinate, holder }) => {
            assert_eq!(coordinate, c);
            assert_eq!(holder, a.peer_id());
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(a.apply_edit(c, CompletionStatus::Complete).await.unwrap(), 1);
    host.flush_broadcasts();
    wait_for(&mut b_events, |e| matches!(e, SessionEvent::Delta (d) if d.coordinate == c)).await;
    let seen = b.chunk(&c).unwrap();
    assert_eq!(seen.status, CompletionStatus::Complete);
    assert_eq!(seen.version, 1);
    assert_eq!(seen.last_modified_by, Some(a.peer_id()));

    a.end_edit(c).await.unwrap();
    assert!(a.held_locks().is_empty());
    wait_for(&mut b_events, |e| *e == SessionEvent::LockReleased (c)).await;
    b.begin_edit(c).await.unwrap();
    assert_eq!(b.held_locks(), vec![c]);
}

#[tokio::test]
async fn stale_edit_is_discarded_for_the_host_state() {
    let (host, addr) = start_host(timings()).await;
    let a = join(addr, "a", &timings()).await;
    let b = join(addr, "b", &timings()).await;
    let mut a_events = a.events();
    let c = ChunkCoordinate::new(5, 5);

    // b edits while a never hears about it
    b.begin_edit(c).await.unwrap();
    b.apply_edit(c, CompletionStatus::Partial).await.unwrap();
    b.end_edit(c).await.unwrap();

    a.begin_edit(c).await.unwrap();
    match a.apply_edit(c, CompletionStatus::Complete).await {
        Err(SyncError::VersionConflict { coordinate, current }) => {
            assert_eq!(coordinate, c);
            assert_eq!(current, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(a.chunk(&c), host.chunk(&c));
    assert_eq!(a.chunk(&c).unwrap().status, CompletionStatus::Partial);
    wait_for(&mut a_events, |e| matches!(e, SessionEvent::EditRejected { .. })).await;

    // still holding the lock, a retries against the fresh version
    assert_eq!(a.apply_edit(c, CompletionStatus::Complete).await.unwrap(), 2);
    assert_eq!(host.chunk(&c).unwrap().status, CompletionStatus::Complete);

    let mut b_events = b.events();
    host.flush_broadcasts();
    wait_for(&mut b_events, |e| matches!(e, SessionEvent::Delta (d) if d.version == 2)).await;
    assert_eq!(b.chunk(&c), host.chunk(&c));
}

#[tokio::test]
async fn editing_without_a_lock_never_leaves_the_client() {
    let (host, addr) = start_host(timings()).await;
    let a = join(addr, "a", &timings()).await;
    let c = ChunkCoordinate::new(1, 1);

    assert!(matches!(a.apply_edit(c, CompletionStatus::Complete).await, Err(SyncError::NotLockHolder (_))));
    assert_eq!(host.chunk(&c).unwrap().version, 0);
    assert!(matches!(
        a.begin_edit(ChunkCoordinate::new(40, 40)).await,
        Err(SyncError::UnknownChunk (_))
    ));
}

#[tokio::test]
async fn expired_lock_is_dropped_from_the_held_set() {
    let timings = SessionTimings {
        lock_ttl: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(50),
        ..timings()
    };
    let (host, addr) = start_host(timings.clone()).await;
    let _timers = host.spawn_timers();
    let a = join(addr, "a", &timings).await;
    let mut events = a.events();
    let c = ChunkCoordinate::new(3, 3);

    a.begin_edit(c).await.unwrap();
    assert_eq!(a.held_locks(), vec![c]);
    wait_for(&mut events, |e| *e == SessionEvent::LockReleased (c)).await;
    assert!(a.held_locks().is_empty());
    assert!(matches!(a.apply_edit(c, CompletionStatus::Complete).await, Err(SyncError::NotLockHolder (_))));
}

#[tokio::test]
async fn host_shutdown_is_reported_as_host_lost() {
    let (host, addr) = start_host(timings()).await;
    let a = join(addr, "a", &timings()).await;
    let mut events = a.events();

    host.shutdown();
    wait_for(&mut events, |e| *e == SessionEvent::HostLost).await;
    assert!(a.is_closed());
    assert!(matches!(a.begin_edit(ChunkCoordinate::new(0, 0)).await, Err(SyncError::SessionClosed)));
}

#[tokio::test]
async fn leaving_frees_locks_for_others() {
    let (host, addr) = start_host(timings()).await;
    let a = join(addr, "a", &timings()).await;
    let b = join(addr, "b", &timings()).await;
    let mut b_events = b.events();
    let c = ChunkCoordinate::new(2, 3);
    let a_id = a.peer_id();

    a.begin_edit(c).await.unwrap();
    a.disconnect().await;

    wait_for(&mut b_events, |e| *e == SessionEvent::PeerLeft (a_id)).await;
    assert!(b.peers().iter().all(|p| p.peer_id != a_id));
    assert!(b.locks().is_empty());
    b.begin_edit(c).await.unwrap();
    assert!(host.peers().iter().all(|p| p.peer_id != a_id));
}
