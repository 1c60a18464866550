use std::{io::{self, Write}, net::{IpAddr, SocketAddr}};

use anyhow::{bail, Context};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{codec::*, dequeue::{dequeue_msg, write_frame}, peer::{PeerId, PeerInfo}};

pub const BEACON_MAGIC: &[u8; 4] = b"MAPS";
pub const PROTOCOL_VERSION: u16 = 1;
const BEACON_MSG_TYPE: u32 = 0x4245_4143;

/// Presence announcement a host broadcasts on the discovery port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub peer_id: PeerId,
    pub display_name: String,
    pub address: IpAddr,
    pub port: u16,
}

impl Beacon {
    pub fn service_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn host_info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id,
            display_name: self.display_name.clone(),
            address: self.service_addr(),
            is_host: true,
        }
    }

    pub fn pack(&self, wtr: &mut impl Write) -> io::Result<()> {
        let mut body = Vec::new();
        body.write_all(BEACON_MAGIC)?;
        body.write_u16::<LittleEndian>(PROTOCOL_VERSION)?;
        write_peer_id(&mut body, &self.peer_id)?;
        write_str(&mut body, &self.display_name)?;
        write_ip(&mut body, &self.address)?;
        body.write_u16::<LittleEndian>(self.port)?;
        write_frame(wtr, BEACON_MSG_TYPE, &body)
    }

    pub fn to_datagram(&self) -> io::Result<Vec<u8>> {
        let mut datagram = Vec::new();
        self.pack(&mut datagram)?;
        Ok(datagram)
    }

    /// Decodes one whole datagram; anything else on the port is an error.
    pub fn decode_datagram(datagram: &[u8]) -> anyhow::Result<Beacon> {
        let (begin, end) = dequeue_msg(datagram)?.context("truncated beacon")?;
        if end != datagram.len() {
            bail!("datagram carries {} extra bytes", datagram.len() - end);
        }
        let mut rdr = &datagram[begin..end];
        let msg_type = rdr.read_u32::<LittleEndian>()?;
        if msg_type != BEACON_MSG_TYPE {
            bail!("not a beacon: msg type {msg_type:#x}");
        }
        if read_bytes(&mut rdr, 4)? != BEACON_MAGIC {
            bail!("bad beacon magic");
        }
        let version = rdr.read_u16::<LittleEndian>()?;
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {version}");
        }
        let peer_id = read_peer_id(&mut rdr)?;
        let display_name = read_str(&mut rdr)?;
        let address = read_ip(&mut rdr)?;
        let port = rdr.read_u16::<LittleEndian>()?;
        if !rdr.is_empty() {
            bail!("{} trailing bytes in beacon", rdr.len());
        }
        Ok(Beacon { peer_id, display_name, address, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon() -> Beacon {
        Beacon {
            peer_id: PeerId::new(),
            display_name: "host".into(),
            address: "192.168.1.20".parse().unwrap(),
            port: 8080,
        }
    }

    #[test]
    fn beacon_decodes_from_datagram() {
        let beacon = beacon();
        let datagram = beacon.to_datagram().unwrap();
        let decoded = Beacon::decode_datagram(&datagram).unwrap();
        assert_eq!(decoded, beacon);
        assert_eq!(decoded.host_info().address, "192.168.1.20:8080".parse().unwrap());
        assert!(decoded.host_info().is_host);
    }

    #[test]
    fn foreign_datagrams_are_rejected() {
        assert!(Beacon::decode_datagram(b"hello there").is_err());
        assert!(Beacon::decode_datagram(&[]).is_err());

        let mut datagram = beacon().to_datagram().unwrap();
        datagram.push(0);
        assert!(Beacon::decode_datagram(&datagram).is_err());

        let mut datagram = beacon().to_datagram().unwrap();
        datagram[8] = b'X';
        assert!(Beacon::decode_datagram(&datagram).is_err());
    }
}
