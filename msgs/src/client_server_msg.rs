use std::io::{self, Write};

use anyhow::bail;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{chunk::{ChunkCoordinate, CompletionStatus}, codec::*, dequeue::{dequeue_msg, write_frame}, peer::PeerId};

/// Messages a client sends to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientServerMsg {
    Disconnect (PeerId),
    Hello {
        peer_id: PeerId,
        display_name: String,
    },
    LockRequest {
        request_id: u32,
        coordinate: ChunkCoordinate,
    },
    LockRelease {
        request_id: u32,
        coordinate: ChunkCoordinate,
    },
    UpdateSubmit {
        request_id: u32,
        coordinate: ChunkCoordinate,
        status: CompletionStatus,
        expected_version: u64,
    },
    Heartbeat {
        peer_id: PeerId,
        timestamp_ms: i64,
        /// Host revision the client has applied so far.
        revision: u64,
    },
    ResyncRequest,
}

impl ClientServerMsg {
    /// Outer error: the stream framing is broken. Inner error: one frame
    /// could not be decoded and should be skipped.
    pub fn dequeue_and_decode(input_buffer: &[u8]) -> anyhow::Result<Option<(usize, anyhow::Result<ClientServerMsg>)>> {
        let Some((begin, end)) = dequeue_msg(input_buffer)? else { return Ok(None) };
        let msg = Self::decode(&input_buffer[begin..end]);
        Ok(Some((end, msg)))
    }

    pub fn decode(input_buffer: &[u8]) -> anyhow::Result<ClientServerMsg> {
        let mut rdr = input_buffer;
        let msg_type_index = rdr.read_u32::<LittleEndian>()?;

        let msg = match msg_type_index {
            0 => {
                ClientServerMsg::Disconnect (read_peer_id(&mut rdr)?)
            }
            1 => {
                let peer_id = read_peer_id(&mut rdr)?;
                let display_name = read_str(&mut rdr)?;
                ClientServerMsg::Hello { peer_id, display_name }
            }
            2 => {
                let request_id = rdr.read_u32::<LittleEndian>()?;
                let coordinate = read_coordinate(&mut rdr)?;
                ClientServerMsg::LockRequest { request_id, coordinate }
            }
            3 => {
                let request_id = rdr.read_u32::<LittleEndian>()?;
                let coordinate = read_coordinate(&mut rdr)?;
                ClientServerMsg::LockRelease { request_id, coordinate }
            }
            4 => {
                let request_id = rdr.read_u32::<LittleEndian>()?;
                let coordinate = read_coordinate(&mut rdr)?;
                let status = read_status(&mut rdr)?;
                let expected_version = rdr.read_u64::<LittleEndian>()?;
                ClientServerMsg::UpdateSubmit { request_id, coordinate, status, expected_version }
            }
            5 => {
                let peer_id = read_peer_id(&mut rdr)?;
                let timestamp_ms = rdr.read_i64::<LittleEndian>()?;
                let revision = rdr.read_u64::<LittleEndian>()?;
                ClientServerMsg::Heartbeat { peer_id, timestamp_ms, revision }
            }
            6 => ClientServerMsg::ResyncRequest,
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
            ClientServerMsg::Disconnect (_) => 0,
            ClientServerMsg::Hello { .. } => 1,
            ClientServerMsg::LockRequest { .. } => 2,
            ClientServerMsg::LockRelease { .. } => 3,
            ClientServerMsg::UpdateSubmit { .. } => 4,
            ClientServerMsg::Heartbeat { .. } => 5,
            ClientServerMsg::ResyncRequest => 6,
        }
    }

    pub fn pack(&self, wtr: &mut impl Write) -> io::Result<()> {
        let mut body = Vec::new();
        match self {
            ClientServerMsg::Disconnect (peer_id) => {
                write_peer_id(&mut body, peer_id)?;
            }
            ClientServerMsg::Hello { peer_id, display_name } => {
                write_peer_id(&mut body, peer_id)?;
                write_str(&mut body, display_name)?;
            }
            ClientServerMsg::LockRequest { request_id, coordinate }
            | ClientServerMsg::LockRelease { request_id, coordinate } => {
                body.write_u32::<LittleEndian>(*request_id)?;
                write_coordinate(&mut body, coordinate)?;
            }
            ClientServerMsg::UpdateSubmit { request_id, coordinate, status, expected_version } => {
                body.write_u32::<LittleEndian>(*request_id)?;
                write_coordinate(&mut body, coordinate)?;
                write_status(&mut body, *status)?;
                body.write_u64::<LittleEndian>(*expected_version)?;
            }
            ClientServerMsg::Heartbeat { peer_id, timestamp_ms, revision } => {
                write_peer_id(&mut body, peer_id)?;
                body.write_i64::<LittleEndian>(*timestamp_ms)?;
                body.write_u64::<LittleEndian>(*revision)?;
            }
            ClientServerMsg::ResyncRequest => {}
        }
        write_frame(wtr, self.msg_type(), &body)
    }

    pub fn to_frame(&self) -> io::Result<Vec<u8>> {
        let mut frame = Vec::new();
        self.pack(&mut frame)?;
        Ok(frame)
    }
}
