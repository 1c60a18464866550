use std::io::{self, Write};

use anyhow::bail;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{chunk::{ChunkCoordinate, ChunkState}, codec::*, dequeue::{dequeue_msg, write_frame}, lock::ChunkLock, model::{Delta, Snapshot}, peer::{PeerId, PeerInfo}};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    DuplicatePeer,
    ExpectedHello,
    SessionFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDenial {
    AlreadyLocked (PeerId),
    UnknownChunk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted (ChunkLock),
    Denied (LockDenial),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotHolder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Accepted { version: u64 },
    /// Version mismatch; carries the host's authoritative state.
    Rejected { current: ChunkState },
    NotLockHolder { current: ChunkState },
    UnknownChunk,
}

/// Messages the host sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerClientMsg {
    Snapshot (Snapshot),
    Rejected (RejectReason),
    LockResponse {
        request_id: u32,
        outcome: LockOutcome,
    },
    ReleaseResponse {
        request_id: u32,
        outcome: ReleaseOutcome,
    },
    UpdateResult {
        request_id: u32,
        outcome: UpdateOutcome,
    },
    Delta (Delta),
    PeerJoined (PeerInfo),
    PeerLeft (PeerId),
    LockAcquired (ChunkLock),
    LockReleased (ChunkCoordinate),
    HostShutdown (PeerId),
    /// Answer to a client heartbeat, carrying the host's revision.
    HeartbeatAck { revision: u64 },
}

impl ServerClientMsg {
    pub fn dequeue_and_decode(input_buffer: &[u8]) -> anyhow::Result<Option<(usize, anyhow::Result<ServerClientMsg>)>> {
        let Some((begin, end)) = dequeue_msg(input_buffer)? else { return Ok(None) };
        let msg = Self::decode(&input_buffer[begin..end]);
        Ok(Some((end, msg)))
    }

    pub fn decode(input_buffer: &[u8]) -> anyhow::Result<ServerClientMsg> {
        let mut rdr = input_buffer;
        let msg_type_index = rdr.read_u32::<LittleEndian>()?;

        let msg = match msg_type_index {
            0 => ServerClientMsg::Snapshot (read_snapshot(&mut rdr)?),
            1 => {
                let reason = match rdr.read_u8()? {
                    0 => RejectReason::DuplicatePeer,
                    1 => RejectReason::ExpectedHello,
                    2 => RejectReason::SessionFull,
                    index => bail!("unsupported reject reason: {index}"),
                };
                ServerClientMsg::Rejected (reason)
            }
            2 => {
                let request_id = rdr.read_u32::<LittleEndian>()?;
                let outcome = match rdr.read_u8()? {
                    0 => LockOutcome::Granted (read_lock(&mut rdr)?),
                    1 => LockOutcome::Denied (LockDenial::AlreadyLocked (read_peer_id(&mut rdr)?)),
                    2 => LockOutcome::Denied (LockDenial::UnknownChunk),
                    index => bail!("unsupported lock outcome: {index}"),
                };
                ServerClientMsg::LockResponse { request_id, outcome }
            }
            3 => {
                let request_id = rdr.read_u32::<LittleEndian>()?;
                let outcome = match rdr.read_u8()? {
                    0 => ReleaseOutcome::Released,
                    1 => ReleaseOutcome::NotHolder,
                    index => bail!("unsupported release outcome: {index}"),
                };
                ServerClientMsg::ReleaseResponse { request_id, outcome }
            }
            4 => {
                let request_id = rdr.read_u32::<LittleEndian>()?;
                let outcome = match rdr.read_u8()? {
                    0 => UpdateOutcome::Accepted { version: rdr.read_u64::<LittleEndian>()? },
                    1 => UpdateOutcome::Rejected { current: read_chunk_state(&mut rdr)? },
                    2 => UpdateOutcome::NotLockHolder { current: read_chunk_state(&mut rdr)? },
                    3 => UpdateOutcome::UnknownChunk,
                    index => bail!("unsupported update outcome: {index}"),
                };
                ServerClientMsg::UpdateResult { request_id, outcome }
            }
            5 => ServerClientMsg::Delta (read_delta(&mut rdr)?),
            6 => ServerClientMsg::PeerJoined (read_peer_info(&mut rdr)?),
            7 => ServerClientMsg::PeerLeft (read_peer_id(&mut rdr)?),
            8 => ServerClientMsg::LockAcquired (read_lock(&mut rdr)?),
            9 => ServerClientMsg::LockReleased (read_coordinate(&mut rdr)?),
            10 => ServerClientMsg::HostShutdown (read_peer_id(&mut rdr)?),
            11 => ServerClientMsg::HeartbeatAck { revision: rdr.read_u64::<LittleEndian>()? },
            type_index => {
                bail!("unsupported msg type: {type_index}");
            }
        };

        if !rdr.is_empty() {
            bail!("{} trailing bytes after msg type {msg_type_index}", rdr.len());
        }

        Ok(msg)
    }

    pub fn msg_type(&self) -> u32 {
        match self {
            ServerClientMsg::Snapshot (_) => 0,
            ServerClientMsg::Rejected (_) => 1,
            ServerClientMsg::LockResponse { .. } => 2,
            ServerClientMsg::ReleaseResponse { .. } => 3,
            ServerClientMsg::UpdateResult { .. } => 4,
            ServerClientMsg::Delta (_) => 5,
            ServerClientMsg::PeerJoined (_) => 6,
            ServerClientMsg::PeerLeft (_) => 7,
            ServerClientMsg::LockAcquired (_) => 8,
            ServerClientMsg::LockReleased (_) => 9,
            ServerClientMsg::HostShutdown (_) => 10,
            ServerClientMsg::HeartbeatAck { .. } => 11,
        }
    }

    pub fn pack(&self, wtr: &mut impl Write) -> io::Result<()> {
        let mut body = Vec::new();
        match self {
            ServerClientMsg::Snapshot (snapshot) => write_snapshot(&mut body, snapshot)?,
            ServerClientMsg::Rejected (reason) => {
                let index = match reason {
                    RejectReason::DuplicatePeer => 0,
                    RejectReason::ExpectedHello => 1,
                    RejectReason::SessionFull => 2,
                };
                body.write_u8(index)?;
            }
            ServerClientMsg::LockResponse { request_id, outcome } => {
                body.write_u32::<LittleEndian>(*request_id)?;
                match outcome {
                    LockOutcome::Granted (lock) => {
                        body.write_u8(0)?;
                        write_lock(&mut body, lock)?;
                    }
                    LockOutcome::Denied (LockDenial::AlreadyLocked (holder)) => {
                        body.write_u8(1)?;
                        write_peer_id(&mut body, holder)?;
                    }
                    LockOutcome::Denied (LockDenial::UnknownChunk) => body.write_u8(2)?,
                }
            }
            ServerClientMsg::ReleaseResponse { request_id, outcome } => {
                body.write_u32::<LittleEndian>(*request_id)?;
                let index = match outcome {
                    ReleaseOutcome::Released => 0,
                    ReleaseOutcome::NotHolder => 1,
                };
                body.write_u8(index)?;
            }
            ServerClientMsg::UpdateResult { request_id, outcome } => {
                body.write_u32::<LittleEndian>(*request_id)?;
                match outcome {
                    UpdateOutcome::Accepted { version } => {
                        body.write_u8(0)?;
                        body.write_u64::<LittleEndian>(*version)?;
                    }
                    UpdateOutcome::Rejected { current } => {
                        body.write_u8(1)?;
                        write_chunk_state(&mut body, current)?;
                    }
                    UpdateOutcome::NotLockHolder { current } => {
                        body.write_u8(2)?;
                        write_chunk_state(&mut body, current)?;
                    }
                    UpdateOutcome::UnknownChunk => body.write_u8(3)?,
                }
            }
            ServerClientMsg::Delta (delta) => write_delta(&mut body, delta)?,
            ServerClientMsg::PeerJoined (info) => write_peer_info(&mut body, info)?,
            ServerClientMsg::PeerLeft (peer_id) => write_peer_id(&mut body, peer_id)?,
            ServerClientMsg::LockAcquired (lock) => write_lock(&mut body, lock)?,
            ServerClientMsg::LockReleased (coordinate) => write_coordinate(&mut body, coordinate)?,
            ServerClientMsg::HostShutdown (peer_id) => write_peer_id(&mut body, peer_id)?,
            ServerClientMsg::HeartbeatAck { revision } => body.write_u64::<LittleEndian>(*revision)?,
        }
        write_frame(wtr, self.msg_type(), &body)
    }

    pub fn to_frame(&self) -> io::Result<Vec<u8>> {
        let mut frame = Vec::new();
        self.pack(&mut frame)?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::chunk::CompletionStatus;

    fn decode_one(msg: &ServerClientMsg) -> ServerClientMsg {
        let frame = msg.to_frame().unwrap();
        let (end, decoded) = ServerClientMsg::dequeue_and_decode(&frame).unwrap().unwrap();
        assert_eq!(end, frame.len());
        decoded.unwrap()
    }

    #[test]
    fn snapshot_carries_locks_and_peers() {
        let host = PeerId::new();
        let lock = ChunkLock {
            coordinate: ChunkCoordinate::new(2, 3),
            holder: host,
            acquired_at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            ttl: Duration::from_secs(300),
        };
        let mut chunk = ChunkState::new(ChunkCoordinate::new(2, 3), CompletionStatus::Partial);
        chunk.version = 4;
        chunk.last_modified_by = Some(host);
        let snapshot = Snapshot {
            revision: 9,
            chunks: vec![chunk, ChunkState::new(ChunkCoordinate::new(0, 0), CompletionStatus::Empty)],
            locks: vec![lock],
            peers: vec![PeerInfo {
                peer_id: host,
                display_name: "host".into(),
                address: "192.168.1.20:8080".parse().unwrap(),
                is_host: true,
            }],
        };
        let msg = ServerClientMsg::Snapshot (snapshot);
        assert_eq!(decode_one(&msg), msg);
    }

    #[test]
    fn update_rejection_carries_current_state() {
        let mut current = ChunkState::new(ChunkCoordinate::new(1, 1), CompletionStatus::Complete);
        current.version = 3;
        let msg = ServerClientMsg::UpdateResult {
            request_id: 12,
            outcome: UpdateOutcome::Rejected { current },
        };
        assert_eq!(decode_one(&msg), msg);
    }

    #[test]
    fn lock_denial_names_the_holder() {
        let holder = PeerId::new();
        let msg = ServerClientMsg::LockResponse {
            request_id: 1,
            outcome: LockOutcome::Denied (LockDenial::AlreadyLocked (holder)),
        };
        match decode_one(&msg) {
            ServerClientMsg::LockResponse { outcome: LockOutcome::Denied (LockDenial::AlreadyLocked (by)), .. } => assert_eq!(by, holder),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn heartbeat_ack_and_full_session_rejection() {
        let ack = ServerClientMsg::HeartbeatAck { revision: u64::MAX - 1 };
        let frame = ack.to_frame().unwrap();
        assert_eq!(frame.len(), 4 + 4 + 8);
        assert_eq!(decode_one(&ack), ack);

        let full = ServerClientMsg::Rejected (RejectReason::SessionFull);
        assert_eq!(decode_one(&full), full);
    }

    #[test]
    fn unknown_outcome_tag_is_malformed() {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(5).unwrap();
        body.write_u8(9).unwrap();
        let mut frame = Vec::new();
        write_frame(&mut frame, 3, &body).unwrap();
        let (_, msg) = ServerClientMsg::dequeue_and_decode(&frame).unwrap().unwrap();
        assert!(msg.is_err());
    }
}
