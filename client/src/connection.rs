use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use msgs::{
    chunk::{ChunkCoordinate, ChunkState},
    client_server_msg::ClientServerMsg,
    error::SyncError,
    lock::ChunkLock,
    model::Delta,
    peer::{PeerId, PeerInfo},
    server_client_msg::ServerClientMsg,
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::mirror::{ChunkMirror, DeltaOutcome};

pub const CONNECT_ATTEMPTS: u32 = 5;
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(3);

/// What a session reports to whoever is watching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Resynced { revision: u64 },
    Delta (Delta),
    PeerJoined (PeerInfo),
    PeerLeft (PeerId),
    LockAcquired (ChunkLock),
    LockReleased (ChunkCoordinate),
    EditRejected { current: ChunkState },
    HostLost,
}

/// Connects to the host, doubling the pause between attempts.
pub async fn connect_with_retry(addr: SocketAddr, attempts: u32, initial_backoff: Duration) -> Result<TcpStream, SyncError> {
    let mut backoff = initial_backoff;
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match TcpStream::connect(addr).await {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                debug!(attempt, "connecting to {addr} failed: {e}");
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
    Err(SyncError::NetworkUnreachable {
        address: addr.to_string(),
        reason: last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string()),
    })
}

pub(crate) async fn write_msg(socket: &mut TcpStream, msg: &ClientServerMsg) -> Result<(), SyncError> {
    let frame = msg.to_frame()?;
    socket.write_all(&frame).await?;
    Ok(())
}

/// Reads exactly one message, keeping whatever follows it in `input_buffer`.
pub(crate) async fn read_msg(socket: &mut TcpStream, input_buffer: &mut Vec<u8>) -> Result<ServerClientMsg, SyncError> {
    let mut static_buffer = [0; 1024];
    loop {
        let dequeued = ServerClientMsg::dequeue_and_decode(&input_buffer[..])
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

/// State shared between the session handle and its connection task.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub mirror: ChunkMirror,
    pub held: BTreeSet<ChunkCoordinate>,
    pub pending: HashMap<u32, oneshot::Sender<ServerClientMsg>>,
    pub closed: bool,
    /// Set when we asked to leave, so the close is not reported as a loss.
    pub leaving: bool,
}

enum Step {
    Continue,
    Send (ClientServerMsg),
    Close,
}

pub(crate) struct Connection {
    pub socket: TcpStream,
    pub input_buffer: Vec<u8>,
    pub shared: Arc<Mutex<Shared>>,
    pub outbound: mpsc::Receiver<ClientServerMsg>,
    pub events: broadcast::Sender<SessionEvent>,
    pub peer_id: PeerId,
    pub heartbeat_interval: Duration,
    /// The host answers every heartbeat, so silence this long means it is gone.
    pub liveness_timeout: Duration,
    pub malformed_tolerance: u32,
}

impl Connection {
    fn emit(&self, event: SessionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn handle(&self, msg: ServerClientMsg) -> Step {
        let mut shared = self.shared.lock();
        match msg {
            ServerClientMsg::Snapshot (snapshot) => {
                let revision = snapshot.revision;
                shared.mirror.apply_snapshot(snapshot);
                // locks the host no longer knows about are gone
                let Shared { mirror, held, .. } = &mut *shared;
                held.retain(|c| mirror.lock(c).is_some_and(|l| l.holder == self.peer_id));
                drop(shared);
                self.emit(SessionEvent::Resynced { revision });
            }
            ServerClientMsg::Delta (delta) => match shared.mirror.apply_delta(&delta) {
                DeltaOutcome::Applied => {
                    drop(shared);
                    self.emit(SessionEvent::Delta (delta));
                }
                DeltaOutcome::Stale => debug!("ignoring stale delta for {} v{}", delta.coordinate.reference(), delta.version),
                DeltaOutcome::Gap => {
                    if shared.mirror.request_resync() {
                        info!("missed an update to {}, asking for a snapshot", delta.coordinate.reference());
                        return Step::Send (ClientServerMsg::ResyncRequest);
                    }
                }
            },
            ServerClientMsg::LockResponse { request_id, .. }
            | ServerClientMsg::ReleaseResponse { request_id, .. }
            | ServerClientMsg::UpdateResult { request_id, .. } => match shared.pending.remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => warn!(request_id, "response to a request nobody is waiting for"),
            },
            ServerClientMsg::PeerJoined (info) => {
                shared.mirror.peer_joined(info.clone());
                drop(shared);
                self.emit(SessionEvent::PeerJoined (info));
            }
            ServerClientMsg::PeerLeft (peer_id) => {
                shared.mirror.peer_left(&peer_id);
                drop(shared);
                self.emit(SessionEvent::PeerLeft (peer_id));
            }
            ServerClientMsg::LockAcquired (lock) => {
                shared.mirror.lock_acquired(lock.clone());
                drop(shared);
                self.emit(SessionEvent::LockAcquired (lock));
            }
            ServerClientMsg::LockReleased (coordinate) => {
                shared.mirror.lock_released(&coordinate);
                if shared.held.remove(&coordinate) {
                    info!("our lock on {} was released by the host", coordinate.reference());
                }
                drop(shared);
                self.emit(SessionEvent::LockReleased (coordinate));
            }
            ServerClientMsg::HeartbeatAck { revision } => debug!(revision, "heartbeat acknowledged"),
            ServerClientMsg::Rejected (reason) => warn!("host rejected us mid-session: {reason:?}"),
            ServerClientMsg::HostShutdown (host) => {
                info!("host {} is shutting down", host.short());
                return Step::Close;
            }
        }
        Step::Continue
    }

    fn close(&self) {
        let leaving = {
            let mut shared = self.shared.lock();
            shared.closed = true;
            // waiting requests see their sender dropped
            shared.pending.clear();
            shared.held.clear();
            shared.leaving
        };
        if !leaving {
            self.emit(SessionEvent::HostLost);
        }
    }

    pub async fn run(mut self) {
        let mut static_buffer = [0; 1024];
        let mut malformed_in_a_row = 0;
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                outgoing = self.outbound.recv() => {
                    let Some(msg) = outgoing else { break };
                    let leaving = matches!(msg, ClientServerMsg::Disconnect (_));
                    if let Err(e) = write_msg(&mut self.socket, &msg).await {
                        warn!("failed to write to host: {e}");
                        break;
                    }
                    if leaving {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let revision = self.shared.lock().mirror.revision();
                    let heartbeat = ClientServerMsg::Heartbeat {
                        peer_id: self.peer_id,
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                        revision,
                    };
                    if let Err(e) = write_msg(&mut self.socket, &heartbeat).await {
                        warn!("failed to send heartbeat: {e}");
                        break;
                    }
                }
                _ = tokio::time::sleep_until(last_heard + self.liveness_timeout) => {
                    warn!("nothing from the host for {:?}, giving up", self.liveness_timeout);
                    break;
                }
                result = self.socket.read(&mut static_buffer) => {
                    let len = match result {
                        Ok(len) => len,
                        Err(e) => {
                            warn!("error while reading from host: {e}");
                            break;
                        }
                    };
                    if len == 0 {
                        debug!("host closed the connection");
                        break;
                    }
                    last_heard = Instant::now();
                    self.input_buffer.extend(&static_buffer[..len]);

                    let mut close = false;
                    loop {
                        let (end, msg) = match ServerClientMsg::dequeue_and_decode(&self.input_buffer[..]) {
                            Ok(Some(frame)) => frame,
                            Ok(None) => break,
                            Err(e) => {
                                warn!("unrecoverable framing error from host: {e}");
                                close = true;
                                break;
                            }
                        };
                        self.input_buffer.drain(..end);

                        let msg = match msg {
                            Ok(msg) => {
                                malformed_in_a_row = 0;
                                msg
                            }
                            Err(e) => {
                                malformed_in_a_row += 1;
                                warn!(malformed_in_a_row, "dropping malformed msg from host: {e}");
                                if malformed_in_a_row > self.malformed_tolerance {
                                    close = true;
                                    break;
                                }
                                continue;
                            }
                        };

                        match self.handle(msg) {
                            Step::Continue => {}
                            Step::Send (reply) => {
                                if let Err(e) = write_msg(&mut self.socket, &reply).await {
                                    warn!("failed to write to host: {e}");
                                    close = true;
                                    break;
                                }
                            }
                            Step::Close => {
                                close = true;
                                break;
                            }
                        }
                    }
                    if close {
                        break;
                    }
                }
            }
        }

        self.close();
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn retry_gives_up_with_network_unreachable() {
        // grab a free port and release it so nothing listens there
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_with_retry(addr, 3, Duration::from_millis(10)).await.unwrap_err();
        match err {
            SyncError::NetworkUnreachable { address, .. } => assert_eq!(address, addr.to_string()),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_connects_once_the_host_is_up() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let late_host = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            listener.accept().await.map(|_| ())
        });

        assert!(connect_with_retry(addr, 8, Duration::from_millis(20)).await.is_ok());
        late_host.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_msg_keeps_trailing_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer_id = PeerId::new();
        let coordinate = ChunkCoordinate::new(1, 1);

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut bytes = ServerClientMsg::PeerLeft (peer_id).to_frame().unwrap();
            bytes.extend(ServerClientMsg::LockReleased (coordinate).to_frame().unwrap());
            socket.write_all(&bytes).await.unwrap();
        });

        let mut socket = TcpStream::connect(addr).await.unwrap();
        let mut input_buffer = Vec::new();
        assert_eq!(read_msg(&mut socket, &mut input_buffer).await.unwrap(), ServerClientMsg::PeerLeft (peer_id));
        assert_eq!(read_msg(&mut socket, &mut input_buffer).await.unwrap(), ServerClientMsg::LockReleased (coordinate));
        assert!(matches!(read_msg(&mut socket, &mut input_buffer).await, Err(SyncError::SessionClosed)));
    }
}
