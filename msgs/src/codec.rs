//! Field-level encoding shared by every message type.
//!
//! Readers take `&mut &[u8]` and advance it; writers take any `Write`.
//! All integers are little endian.

use std::{io::{self, Write}, net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr}, time::Duration};

use anyhow::{bail, Context};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::DateTime;

use crate::{chunk::{ChunkCoordinate, ChunkState, CompletionStatus}, lock::ChunkLock, model::{Delta, Snapshot}, peer::{PeerId, PeerInfo}};

pub const MAX_STRING_LEN: usize = 1024;
pub const MAX_LIST_LEN: usize = 1 << 16;

pub fn read_bytes<'a>(rdr: &mut &'a [u8], len: usize) -> anyhow::Result<&'a [u8]> {
    if rdr.len() < len {
        bail!("truncated field: need {len} bytes, have {}", rdr.len());
    }
    let (head, tail) = rdr.split_at(len);
    *rdr = tail;
    Ok(head)
}

pub fn write_str(wtr: &mut impl Write, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    let len = bytes.len().min(MAX_STRING_LEN);
    // never cut a multi-byte character in half
    let len = (0..=len).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0);
    wtr.write_u32::<LittleEndian>(len as u32)?;
    wtr.write_all(&bytes[..len])
}

pub fn read_str(rdr: &mut &[u8]) -> anyhow::Result<String> {
    let len = rdr.read_u32::<LittleEndian>()? as usize;
    if len > MAX_STRING_LEN {
        bail!("string too long: {len}");
    }
    let bytes = read_bytes(rdr, len)?;
    let s = std::str::from_utf8(bytes).context("string is not utf-8")?;
    Ok(s.to_owned())
}

pub fn write_count(wtr: &mut impl Write, count: usize) -> io::Result<()> {
    wtr.write_u32::<LittleEndian>(count as u32)
}

pub fn read_count(rdr: &mut &[u8]) -> anyhow::Result<usize> {
    let count = rdr.read_u32::<LittleEndian>()? as usize;
    if count > MAX_LIST_LEN {
        bail!("list too long: {count}");
    }
    Ok(count)
}

pub fn write_peer_id(wtr: &mut impl Write, peer_id: &PeerId) -> io::Result<()> {
    wtr.write_all(peer_id.as_bytes())
}

pub fn read_peer_id(rdr: &mut &[u8]) -> anyhow::Result<PeerId> {
    let bytes = read_bytes(rdr, 16)?;
    let mut id = [0u8; 16];
    id.copy_from_slice(bytes);
    Ok(PeerId::from_bytes(id))
}

pub fn write_coordinate(wtr: &mut impl Write, coordinate: &ChunkCoordinate) -> io::Result<()> {
    wtr.write_u16::<LittleEndian>(coordinate.row)?;
    wtr.write_u16::<LittleEndian>(coordinate.column)
}

pub fn read_coordinate(rdr: &mut &[u8]) -> anyhow::Result<ChunkCoordinate> {
    let row = rdr.read_u16::<LittleEndian>()?;
    let column = rdr.read_u16::<LittleEndian>()?;
    Ok(ChunkCoordinate { row, column })
}

pub fn write_status(wtr: &mut impl Write, status: CompletionStatus) -> io::Result<()> {
    wtr.write_u8(status.as_u8())
}

pub fn read_status(rdr: &mut &[u8]) -> anyhow::Result<CompletionStatus> {
    let index = rdr.read_u8()?;
    CompletionStatus::from_u8(index).with_context(|| format!("unsupported completion status: {index}"))
}

pub fn write_chunk_state(wtr: &mut impl Write, state: &ChunkState) -> io::Result<()> {
    write_coordinate(wtr, &state.coordinate)?;
    write_status(wtr, state.status)?;
    wtr.write_u64::<LittleEndian>(state.version)?;
    match &state.last_modified_by {
        Some(peer_id) => {
            wtr.write_u8(1)?;
            write_peer_id(wtr, peer_id)
        }
        None => wtr.write_u8(0),
    }
}

pub fn read_chunk_state(rdr: &mut &[u8]) -> anyhow::Result<ChunkState> {
    let coordinate = read_coordinate(rdr)?;
    let status = read_status(rdr)?;
    let version = rdr.read_u64::<LittleEndian>()?;
    let last_modified_by = match rdr.read_u8()? {
        0 => None,
        1 => Some(read_peer_id(rdr)?),
        flag => bail!("invalid option flag: {flag}"),
    };
    Ok(ChunkState { coordinate, status, version, last_modified_by })
}

pub fn write_lock(wtr: &mut impl Write, lock: &ChunkLock) -> io::Result<()> {
    write_coordinate(wtr, &lock.coordinate)?;
    write_peer_id(wtr, &lock.holder)?;
    wtr.write_i64::<LittleEndian>(lock.acquired_at.timestamp_millis())?;
    wtr.write_u64::<LittleEndian>(lock.ttl.as_millis().min(u64::MAX as u128) as u64)
}

pub fn read_lock(rdr: &mut &[u8]) -> anyhow::Result<ChunkLock> {
    let coordinate = read_coordinate(rdr)?;
    let holder = read_peer_id(rdr)?;
    let millis = rdr.read_i64::<LittleEndian>()?;
    let acquired_at = DateTime::from_timestamp_millis(millis).with_context(|| format!("timestamp out of range: {millis}"))?;
    let ttl = Duration::from_millis(rdr.read_u64::<LittleEndian>()?);
    Ok(ChunkLock { coordinate, holder, acquired_at, ttl })
}

pub fn write_ip(wtr: &mut impl Write, ip: &IpAddr) -> io::Result<()> {
    match ip {
        IpAddr::V4(v4) => {
            wtr.write_u8(4)?;
            wtr.write_all(&v4.octets())
        }
        IpAddr::V6(v6) => {
            wtr.write_u8(6)?;
            wtr.write_all(&v6.octets())
        }
    }
}

pub fn read_ip(rdr: &mut &[u8]) -> anyhow::Result<IpAddr> {
    let ip = match rdr.read_u8()? {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(read_bytes(rdr, 4)?);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(read_bytes(rdr, 16)?);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        tag => bail!("unsupported address family: {tag}"),
    };
    Ok(ip)
}

pub fn write_socket_addr(wtr: &mut impl Write, addr: &SocketAddr) -> io::Result<()> {
    write_ip(wtr, &addr.ip())?;
    wtr.write_u16::<LittleEndian>(addr.port())
}

pub fn read_socket_addr(rdr: &mut &[u8]) -> anyhow::Result<SocketAddr> {
    let ip = read_ip(rdr)?;
    let port = rdr.read_u16::<LittleEndian>()?;
    Ok(SocketAddr::new(ip, port))
}

pub fn write_peer_info(wtr: &mut impl Write, info: &PeerInfo) -> io::Result<()> {
    write_peer_id(wtr, &info.peer_id)?;
    write_str(wtr, &info.display_name)?;
    write_socket_addr(wtr, &info.address)?;
    wtr.write_u8(info.is_host as u8)
}

pub fn read_peer_info(rdr: &mut &[u8]) -> anyhow::Result<PeerInfo> {
    let peer_id = read_peer_id(rdr)?;
    let display_name = read_str(rdr)?;
    let address = read_socket_addr(rdr)?;
    let is_host = rdr.read_u8()? != 0;
    Ok(PeerInfo { peer_id, display_name, address, is_host })
}

pub fn write_delta(wtr: &mut impl Write, delta: &Delta) -> io::Result<()> {
    write_coordinate(wtr, &delta.coordinate)?;
    write_status(wtr, delta.status)?;
    wtr.write_u64::<LittleEndian>(delta.version)?;
    write_peer_id(wtr, &delta.modified_by)
}

pub fn read_delta(rdr: &mut &[u8]) -> anyhow::Result<Delta> {
    let coordinate = read_coordinate(rdr)?;
    let status = read_status(rdr)?;
    let version = rdr.read_u64::<LittleEndian>()?;
    let modified_by = read_peer_id(rdr)?;
    Ok(Delta { coordinate, status, version, modified_by })
}

pub fn write_snapshot(wtr: &mut impl Write, snapshot: &Snapshot) -> io::Result<()> {
    wtr.write_u64::<LittleEndian>(snapshot.revision)?;
    write_count(wtr, snapshot.chunks.len())?;
    for chunk in &snapshot.chunks {
        write_chunk_state(wtr, chunk)?;
    }
    write_count(wtr, snapshot.locks.len())?;
    for lock in &snapshot.locks {
        write_lock(wtr, lock)?;
    }
    write_count(wtr, snapshot.peers.len())?;
    for peer in &snapshot.peers {
        write_peer_info(wtr, peer)?;
    }
    Ok(())
}

pub fn read_snapshot(rdr: &mut &[u8]) -> anyhow::Result<Snapshot> {
    let revision = rdr.read_u64::<LittleEndian>()?;
    let chunk_count = read_count(rdr)?;
    let mut chunks = Vec::with_capacity(chunk_count.min(1024));
    for _ in 0..chunk_count {
        chunks.push(read_chunk_state(rdr)?);
    }
    let lock_count = read_count(rdr)?;
    let mut locks = Vec::with_capacity(lock_count.min(1024));
    for _ in 0..lock_count {
        locks.push(read_lock(rdr)?);
    }
    let peer_count = read_count(rdr)?;
    let mut peers = Vec::with_capacity(peer_count.min(1024));
    for _ in 0..peer_count {
        peers.push(read_peer_info(rdr)?);
    }
    Ok(Snapshot { revision, chunks, locks, peers })
}
