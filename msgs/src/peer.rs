use std::{fmt, net::SocketAddr, str::FromStr};

use uuid::Uuid;

/// Identity of one participant, generated fresh at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId (Uuid);

impl PeerId {
    pub fn new() -> PeerId {
        PeerId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> PeerId {
        PeerId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// First eight hex digits, enough to tell peers apart in a console.
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl Default for PeerId {
    fn default() -> Self {
        PeerId::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerId(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub display_name: String,
    pub address: SocketAddr,
    pub is_host: bool,
}
