use std::{net::SocketAddr, sync::Arc, time::Duration};

use host::{chunk_store::load_states, HostServer, MemoryChunkStore, SessionHost};
use msgs::{
    chunk::{ChunkCoordinate, CompletionStatus},
    client_server_msg::ClientServerMsg,
    config::SessionTimings,
    dequeue::write_frame,
    peer::{PeerId, PeerInfo},
    server_client_msg::{LockDenial, LockOutcome, RejectReason, ServerClientMsg, UpdateOutcome},
};
use tokio::{io::{AsyncReadExt, AsyncWriteExt}, net::TcpStream};

const WAIT: Duration = Duration::from_secs(5);

fn timings() -> SessionTimings {
    SessionTimings {
        sync_interval: None,
        malformed_tolerance: 2,
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

struct RawPeer {
    peer_id: PeerId,
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl RawPeer {
    async fn connect(addr: SocketAddr) -> RawPeer {
        let stream = TcpStream::connect(addr).await.unwrap();
        RawPeer { peer_id: PeerId::new(), stream, buffer: Vec::new() }
    }

    async fn join(addr: SocketAddr, name: &str) -> RawPeer {
        let mut peer = RawPeer::connect(addr).await;
        peer.send(&ClientServerMsg::Hello { peer_id: peer.peer_id, display_name: name.into() }).await;
        assert!(matches!(peer.recv().await, Some(ServerClientMsg::Snapshot (_))));
        peer
    }

    async fn send(&mut self, msg: &ClientServerMsg) {
        self.stream.write_all(&msg.to_frame().unwrap()).await.unwrap();
    }

    /// None when the host closed the connection.
    async fn recv(&mut self) -> Option<ServerClientMsg> {
        let mut chunk = [0; 1024];
        loop {
            if let Some((end, msg)) = ServerClientMsg::dequeue_and_decode(&self.buffer).unwrap() {
                self.buffer.drain(..end);
                return Some(msg.unwrap());
            }
            let len = tokio::time::timeout(WAIT, self.stream.read(&mut chunk)).await.unwrap().unwrap_or(0);
            if len == 0 {
                return None;
            }
            self.buffer.extend(&chunk[..len]);
        }
    }

    async fn recv_until(&mut self, wanted: impl Fn(&ServerClientMsg) -> bool) -> ServerClientMsg {
        loop {
            let msg = self.recv().await.expect("connection closed");
            if wanted(&msg) {
                return msg;
            }
        }
    }
}

#[tokio::test]
async fn hello_gets_a_snapshot_and_duplicates_are_rejected() {
    let (host, addr) = start_host(timings()).await;

    let mut first = RawPeer::connect(addr).await;
    first.send(&ClientServerMsg::Hello { peer_id: first.peer_id, display_name: "a".into() }).await;
    match first.recv().await {
        Some(ServerClientMsg::Snapshot (snapshot)) => {
            assert_eq!(snapshot.chunks.len(), 64);
            assert!(snapshot.peers.iter().any(|p| p.peer_id == first.peer_id));
            assert!(snapshot.peers.iter().any(|p| p.peer_id == host.local_peer().peer_id));
        }
        other => panic!("unexpected {other:?}"),
    }

    let mut twin = RawPeer::connect(addr).await;
    twin.send(&ClientServerMsg::Hello { peer_id: first.peer_id, display_name: "a again".into() }).await;
    assert_eq!(twin.recv().await, Some(ServerClientMsg::Rejected (RejectReason::DuplicatePeer)));
    assert_eq!(twin.recv().await, None);
    assert_eq!(host.peers().len(), 2);
}

#[tokio::test]
async fn first_frame_must_be_hello() {
    let (_host, addr) = start_host(timings()).await;
    let mut peer = RawPeer::connect(addr).await;
    peer.send(&ClientServerMsg::ResyncRequest).await;
    assert_eq!(peer.recv().await, Some(ServerClientMsg::Rejected (RejectReason::ExpectedHello)));
}

#[tokio::test]
async fn two_peers_contend_for_chunk_2_3() {
    let (host, addr) = start_host(timings()).await;
    let mut a = RawPeer::join(addr, "a").await;
    let mut b = RawPeer::join(addr, "b").await;
    let c = ChunkCoordinate::new(2, 3);

    a.send(&ClientServerMsg::LockRequest { request_id: 1, coordinate: c }).await;
    let granted = a.recv_until(|m| matches!(m, ServerClientMsg::LockResponse { .. })).await;
    assert!(matches!(granted, ServerClientMsg::LockResponse { request_id: 1, outcome: LockOutcome::Granted (_) }));

    b.send(&ClientServerMsg::LockRequest { request_id: 7, coordinate: c }).await;
    let denied = b.recv_until(|m| matches!(m, ServerClientMsg::LockResponse { .. })).await;
    assert_eq!(denied, ServerClientMsg::LockResponse {
        request_id: 7,
        outcome: LockOutcome::Denied (LockDenial::AlreadyLocked (a.peer_id)),
    });

    a.send(&ClientServerMsg::UpdateSubmit { request_id: 2, coordinate: c, status: CompletionStatus::Complete, expected_version: 0 }).await;
    let result = a.recv_until(|m| matches!(m, ServerClientMsg::UpdateResult { .. })).await;
    assert_eq!(result, ServerClientMsg::UpdateResult { request_id: 2, outcome: UpdateOutcome::Accepted { version: 1 } });
    a.send(&ClientServerMsg::LockRelease { request_id: 3, coordinate: c }).await;
    a.recv_until(|m| matches!(m, ServerClientMsg::ReleaseResponse { .. })).await;

    host.flush_broadcasts();
    let delta = b.recv_until(|m| matches!(m, ServerClientMsg::Delta (_))).await;
    match delta {
        ServerClientMsg::Delta (delta) => {
            assert_eq!(delta.coordinate, c);
            assert_eq!(delta.version, 1);
            assert_eq!(delta.status, CompletionStatus::Complete);
            assert_eq!(delta.modified_by, a.peer_id);
        }
        other => panic!("unexpected {other:?}"),
    }

    b.send(&ClientServerMsg::LockRequest { request_id: 8, coordinate: c }).await;
    let granted = b.recv_until(|m| matches!(m, ServerClientMsg::LockResponse { .. })).await;
    assert!(matches!(granted, ServerClientMsg::LockResponse { request_id: 8, outcome: LockOutcome::Granted (_) }));
    assert_eq!(host.chunk(&c).unwrap().version, 1);
}

#[tokio::test]
async fn stale_submit_on_chunk_5_5_returns_current_state() {
    let (host, addr) = start_host(timings()).await;
    let mut a = RawPeer::join(addr, "a").await;
    let c = ChunkCoordinate::new(5, 5);

    let me = host.local_peer().peer_id;
    host.request_lock(me, c);
    host.submit_update(me, c, CompletionStatus::Partial, 0);
    host.release_lock(me, c);

    a.send(&ClientServerMsg::LockRequest { request_id: 1, coordinate: c }).await;
    a.recv_until(|m| matches!(m, ServerClientMsg::LockResponse { .. })).await;
    a.send(&ClientServerMsg::UpdateSubmit { request_id: 2, coordinate: c, status: CompletionStatus::Complete, expected_version: 0 }).await;
    match a.recv_until(|m| matches!(m, ServerClientMsg::UpdateResult { .. })).await {
        ServerClientMsg::UpdateResult { request_id: 2, outcome: UpdateOutcome::Rejected { current } } => {
            assert_eq!(current.version, 1);
            assert_eq!(current.status, CompletionStatus::Partial);
            assert_eq!(current.last_modified_by, Some(me));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(host.chunk(&c).unwrap().status, CompletionStatus::Partial);
}

#[tokio::test]
async fn too_many_malformed_frames_drop_the_peer() {
    let (host, addr) = start_host(timings()).await;
    let mut a = RawPeer::join(addr, "a").await;
    let mut b = RawPeer::join(addr, "b").await;
    b.send(&ClientServerMsg::LockRequest { request_id: 1, coordinate: ChunkCoordinate::new(0, 0) }).await;
    b.recv_until(|m| matches!(m, ServerClientMsg::LockResponse { .. })).await;

    let mut junk = Vec::new();
    for _ in 0..3 {
        write_frame(&mut junk, 250, b"garbage").unwrap();
    }
    b.stream.write_all(&junk).await.unwrap();

    let left = a.recv_until(|m| matches!(m, ServerClientMsg::PeerLeft (_))).await;
    assert_eq!(left, ServerClientMsg::PeerLeft (b.peer_id));
    assert_eq!(b.recv().await, None);
    assert!(host.snapshot().locks.is_empty());
}

#[tokio::test]
async fn isolated_malformed_frames_are_tolerated() {
    let (_host, addr) = start_host(timings()).await;
    let mut a = RawPeer::join(addr, "a").await;

    let mut junk = Vec::new();
    write_frame(&mut junk, 250, b"garbage").unwrap();
    a.stream.write_all(&junk).await.unwrap();
    a.send(&ClientServerMsg::ResyncRequest).await;
    assert!(matches!(a.recv().await, Some(ServerClientMsg::Snapshot (_))));
}

#[tokio::test]
async fn disconnect_frees_locks_for_others() {
    let (host, addr) = start_host(timings()).await;
    let mut a = RawPeer::join(addr, "a").await;
    let mut b = RawPeer::join(addr, "b").await;
    let c = ChunkCoordinate::new(1, 1);

    a.send(&ClientServerMsg::LockRequest { request_id: 1, coordinate: c }).await;
    a.recv_until(|m| matches!(m, ServerClientMsg::LockResponse { .. })).await;
    a.send(&ClientServerMsg::Disconnect (a.peer_id)).await;

    let released = b.recv_until(|m| matches!(m, ServerClientMsg::LockReleased (_))).await;
    assert_eq!(released, ServerClientMsg::LockReleased (c));
    assert_eq!(b.recv_until(|m| matches!(m, ServerClientMsg::PeerLeft (_))).await, ServerClientMsg::PeerLeft (a.peer_id));
    assert!(matches!(host.request_lock(b.peer_id, c), LockOutcome::Granted (_)));
}

#[tokio::test]
async fn silent_peer_is_swept_and_its_lock_freed() {
    let timings = SessionTimings {
        peer_liveness_timeout: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(50),
        ..timings()
    };
    let (host, addr) = start_host(timings).await;
    let _timers = host.spawn_timers();
    let mut a = RawPeer::join(addr, "a").await;
    let mut b = RawPeer::join(addr, "b").await;
    let c = ChunkCoordinate::new(0, 0);

    a.send(&ClientServerMsg::LockRequest { request_id: 1, coordinate: c }).await;
    a.recv_until(|m| matches!(m, ServerClientMsg::LockResponse { .. })).await;

    // b keeps heartbeating while a says nothing
    for _ in 0..10 {
        b.send(&ClientServerMsg::Heartbeat { peer_id: b.peer_id, timestamp_ms: 0, revision: 0 }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    while a.recv().await.is_some() {}
    assert!(host.peers().iter().all(|p| p.peer_id != a.peer_id));
    let left = b.recv_until(|m| matches!(m, ServerClientMsg::PeerLeft (_))).await;
    assert_eq!(left, ServerClientMsg::PeerLeft (a.peer_id));
    assert!(matches!(host.request_lock(b.peer_id, c), LockOutcome::Granted (_)));
}

#[tokio::test]
async fn shutdown_notifies_every_peer() {
    let (host, addr) = start_host(timings()).await;
    let mut a = RawPeer::join(addr, "a").await;
    host.shutdown();
    let msg = a.recv_until(|m| matches!(m, ServerClientMsg::HostShutdown (_))).await;
    assert_eq!(msg, ServerClientMsg::HostShutdown (host.local_peer().peer_id));
}

#[tokio::test]
async fn heartbeat_is_answered_with_the_host_revision() {
    let (host, addr) = start_host(timings()).await;
    let mut a = RawPeer::join(addr, "a").await;
    let me = host.local_peer().peer_id;
    let c = ChunkCoordinate::new(4, 4);
    host.request_lock(me, c);
    host.submit_update(me, c, CompletionStatus::Partial, 0);

    a.send(&ClientServerMsg::Heartbeat { peer_id: a.peer_id, timestamp_ms: 0, revision: 0 }).await;
    let ack = a.recv_until(|m| matches!(m, ServerClientMsg::HeartbeatAck { .. })).await;
    assert_eq!(ack, ServerClientMsg::HeartbeatAck { revision: 1 });
}

#[tokio::test]
async fn peer_past_the_resync_threshold_gets_a_snapshot_instead_of_deltas() {
    let timings = SessionTimings { resync_threshold: 2, ..timings() };
    let (host, addr) = start_host(timings).await;
    let mut a = RawPeer::join(addr, "a").await;
    let me = host.local_peer().peer_id;
    let c = ChunkCoordinate::new(3, 6);
    host.request_lock(me, c);
    for version in 0..3 {
        host.submit_update(me, c, CompletionStatus::Partial, version);
    }

    host.flush_broadcasts();
    match a.recv_until(|m| matches!(m, ServerClientMsg::Snapshot (_) | ServerClientMsg::Delta (_))).await {
        ServerClientMsg::Snapshot (snapshot) => {
            assert_eq!(snapshot.revision, 3);
            assert_eq!(snapshot.chunks.iter().find(|s| s.coordinate == c).unwrap().version, 3);
        }
        other => panic!("expected a snapshot, got {other:?}"),
    }

    // caught up again: the next edit travels as a delta
    host.submit_update(me, c, CompletionStatus::Complete, 3);
    host.flush_broadcasts();
    let delta = a.recv_until(|m| matches!(m, ServerClientMsg::Snapshot (_) | ServerClientMsg::Delta (_))).await;
    assert!(matches!(delta, ServerClientMsg::Delta (d) if d.version == 4));
}

#[tokio::test]
async fn connection_behind_the_broadcast_channel_is_resynced() {
    let (host, addr) = start_host(timings()).await;
    let mut a = RawPeer::join(addr, "a").await;
    let me = host.local_peer().peer_id;
    let c = ChunkCoordinate::new(7, 7);

    // no await in between, so a's connection cannot drain the channel
    for _ in 0..200 {
        host.request_lock(me, c);
        host.release_lock(me, c);
    }

    match a.recv_until(|m| matches!(m, ServerClientMsg::Snapshot (_))).await {
        ServerClientMsg::Snapshot (snapshot) => {
            assert!(snapshot.locks.is_empty());
            assert_eq!(snapshot.revision, host.revision());
        }
        other => panic!("unexpected {other:?}"),
    }
    a.send(&ClientServerMsg::LockRequest { request_id: 1, coordinate: c }).await;
    let granted = a.recv_until(|m| matches!(m, ServerClientMsg::LockResponse { .. })).await;
    assert!(matches!(granted, ServerClientMsg::LockResponse { request_id: 1, outcome: LockOutcome::Granted (_) }));
}
