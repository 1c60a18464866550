use std::{net::SocketAddr, sync::Arc, time::Duration};

use msgs::{
    client_server_msg::ClientServerMsg,
    error::SyncError,
    peer::{PeerId, PeerInfo},
    server_client_msg::{RejectReason, ServerClientMsg},
};
use tokio::{io::{AsyncReadExt, AsyncWriteExt}, net::TcpStream, sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{broadcast_msg::BroadcastMsg, host::{DisconnectReason, SessionHost}};

pub fn spawn_client_process(socket: TcpStream, addr: SocketAddr, host: Arc<SessionHost>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match run_client_process(socket, addr, host).await {
            Ok(()) => debug!("connection from {addr} closed"),
            Err(e) => warn!("connection from {addr} ended: {e}"),
        }
    })
}

async fn write_msg(socket: &mut TcpStream, msg: &ServerClientMsg) -> Result<(), SyncError> {
    let frame = msg.to_frame()?;
    socket.write_all(&frame).await?;
    Ok(())
}

async fn read_first_msg(socket: &mut TcpStream, input_buffer: &mut Vec<u8>) -> Result<ClientServerMsg, SyncError> {
    let mut static_buffer = [0; 1024];
    loop {
        let dequeued = ClientServerMsg::dequeue_and_decode(&input_buffer[..])
            .map_err(|e| SyncError::MalformedMessage (e.to_string()))?;
        if let Some((end, msg)) = dequeued {
            input_buffer.drain(..end);
            return msg.map_err(|e| SyncError::MalformedMessage (e.to_string()));
        }
        let len = socket.read(&mut static_buffer).await?;
        if len == 0 {
            return Err(SyncError::SessionClosed);
        }
        input_buffer.extend(&static_buffer[..len]);
    }
}

/// The greeting must arrive within the liveness timeout.
async fn read_greeting(socket: &mut TcpStream, input_buffer: &mut Vec<u8>, timeout: Duration) -> Result<ClientServerMsg, SyncError> {
    match tokio::time::timeout(timeout, read_first_msg(socket, input_buffer)).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::MalformedMessage ("no hello before timeout".into())),
    }
}

enum Flow {
    Continue,
    Reply (ServerClientMsg),
    Leave,
}

fn dispatch(host: &SessionHost, peer_id: PeerId, msg: ClientServerMsg) -> Flow {
    match msg {
        ClientServerMsg::Disconnect (_) => Flow::Leave,
        ClientServerMsg::Hello { .. } => {
            warn!(peer = %peer_id.short(), "ignoring second hello");
            Flow::Continue
        }
        ClientServerMsg::LockRequest { request_id, coordinate } => {
            let outcome = host.request_lock(peer_id, coordinate);
            Flow::Reply (ServerClientMsg::LockResponse { request_id, outcome })
        }
        ClientServerMsg::LockRelease { request_id, coordinate } => {
            let outcome = host.release_lock(peer_id, coordinate);
            Flow::Reply (ServerClientMsg::ReleaseResponse { request_id, outcome })
        }
        ClientServerMsg::UpdateSubmit { request_id, coordinate, status, expected_version } => {
            let outcome = host.submit_update(peer_id, coordinate, status, expected_version);
            Flow::Reply (ServerClientMsg::UpdateResult { request_id, outcome })
        }
        ClientServerMsg::Heartbeat { peer_id: sender, revision, .. } => {
            if sender != peer_id {
                warn!(peer = %peer_id.short(), "heartbeat carries foreign id {}", sender.short());
            }
            host.heartbeat(&peer_id, revision);
            Flow::Reply (ServerClientMsg::HeartbeatAck { revision: host.revision() })
        }
        ClientServerMsg::ResyncRequest => {
            debug!(peer = %peer_id.short(), "resync requested");
            Flow::Reply (ServerClientMsg::Snapshot (host.snapshot()))
        }
    }
}

async fn run_client_process(mut socket: TcpStream, addr: SocketAddr, host: Arc<SessionHost>) -> Result<(), SyncError> {
    let mut input_buffer = Vec::new();
    let timings = host.timings().clone();

    let (peer_id, display_name) = match read_greeting(&mut socket, &mut input_buffer, timings.peer_liveness_timeout).await? {
        ClientServerMsg::Hello { peer_id, display_name } => (peer_id, display_name),
        other => {
            warn!("{addr} opened with {other:?} instead of hello");
            write_msg(&mut socket, &ServerClientMsg::Rejected (RejectReason::ExpectedHello)).await?;
            return Ok(());
        }
    };

    let info = PeerInfo { peer_id, display_name, address: addr, is_host: false };
    let handle = match host.accept_connection(info) {
        Ok(handle) => handle,
        Err(SyncError::DuplicatePeer (id)) => {
            warn!(peer = %id.short(), "duplicate peer id from {addr}, rejecting");
            write_msg(&mut socket, &ServerClientMsg::Rejected (RejectReason::DuplicatePeer)).await?;
            return Err(SyncError::DuplicatePeer (id));
        }
        Err(SyncError::SessionFull (limit)) => {
            warn!("session full ({limit} peers), turning away {addr}");
            write_msg(&mut socket, &ServerClientMsg::Rejected (RejectReason::SessionFull)).await?;
            return Err(SyncError::SessionFull (limit));
        }
        Err(e) => return Err(e),
    };
    let mut rx = handle.receiver;

    let reason = match write_msg(&mut socket, &ServerClientMsg::Snapshot (handle.snapshot)).await {
        Ok(()) => serve_peer(&mut socket, &mut rx, &mut input_buffer, &host, peer_id, timings.malformed_tolerance).await,
        Err(e) => {
            warn!(peer = %peer_id.short(), "failed to send snapshot: {e}");
            Some(DisconnectReason::Left)
        }
    };

    // None: the host already dropped this peer
    if let Some(reason) = reason {
        host.disconnect(&peer_id, reason);
    }
    info!(peer = %peer_id.short(), "connection process for {addr} finished");
    Ok(())
}

async fn serve_peer(
    socket: &mut TcpStream,
    rx: &mut tokio::sync::broadcast::Receiver<BroadcastMsg>,
    input_buffer: &mut Vec<u8>,
    host: &SessionHost,
    peer_id: PeerId,
    malformed_tolerance: u32,
) -> Option<DisconnectReason> {
    let mut static_buffer = [0; 1024];
    let mut malformed_in_a_row = 0;

    loop {
        tokio::select! {
            biased;
            result = rx.recv() => {
                match result {
                    Ok(BroadcastMsg::Send (address, frame)) => {
                        if address.includes(&peer_id) {
                            if let Err(e) = socket.write_all(&frame).await {
                                warn!(peer = %peer_id.short(), "disconnecting because of error while writing to socket: {e}");
                                return Some(DisconnectReason::Left);
                            }
                        }
                    }
                    Ok(BroadcastMsg::Kick (to_kick)) => {
                        if to_kick == peer_id {
                            return None;
                        }
                    }
                    Err(RecvError::Lagged (missed)) => {
                        warn!(peer = %peer_id.short(), missed, "connection fell behind the broadcast, sending snapshot");
                        if let Err(e) = write_msg(socket, &ServerClientMsg::Snapshot (host.snapshot())).await {
                            warn!(peer = %peer_id.short(), "failed to send snapshot: {e}");
                            return Some(DisconnectReason::Left);
                        }
                    }
                    Err(RecvError::Closed) => return Some(DisconnectReason::Left),
                }
            }
            result = socket.read(&mut static_buffer) => {
                let len = match result {
                    Ok(len) => len,
                    Err(e) => {
                        warn!(peer = %peer_id.short(), "error while reading from socket: {e}");
                        return Some(DisconnectReason::Left);
                    }
                };
                if len == 0 {
                    debug!(peer = %peer_id.short(), "peer closed the connection");
                    return Some(DisconnectReason::Left);
                }
                input_buffer.extend(&static_buffer[..len]);

                loop {
                    let (end, msg) = match ClientServerMsg::dequeue_and_decode(&input_buffer[..]) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(peer = %peer_id.short(), "unrecoverable framing error: {e}");
                            return Some(DisconnectReason::Malformed);
                        }
                    };
                    input_buffer.drain(..end);

                    let msg = match msg {
                        Ok(msg) => {
                            malformed_in_a_row = 0;
                            msg
                        }
                        Err(e) => {
                            malformed_in_a_row += 1;
                            warn!(peer = %peer_id.short(), malformed_in_a_row, "dropping malformed msg: {e}");
                            if malformed_in_a_row > malformed_tolerance {
                                return Some(DisconnectReason::Malformed);
                            }
                            continue;
                        }
                    };

                    if !host.touch(&peer_id) {
                        return None;
                    }
                    match dispatch(host, peer_id, msg) {
                        Flow::Continue => {}
                        Flow::Reply (reply) => {
                            if let Err(e) = write_msg(socket, &reply).await {
                                warn!(peer = %peer_id.short(), "failed to reply: {e}");
                                return Some(DisconnectReason::Left);
                            }
                        }
                        Flow::Leave => return Some(DisconnectReason::Left),
                    }
                }
            }
        }
    }
}
