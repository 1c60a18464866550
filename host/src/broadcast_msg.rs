use msgs::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    All,
    Other (PeerId),
    Peer (PeerId),
}

impl Address {
    pub fn includes(&self, peer_id: &PeerId) -> bool {
        match self {
            Address::All => true,
            Address::Other (excluded) => excluded != peer_id,
            Address::Peer (target) => target == peer_id,
        }
    }
}

/// Fan-out from the host to every connection process. Frames are encoded
/// once; each process writes the ones addressed to it.
#[derive(Debug, Clone)]
pub enum BroadcastMsg {
    Send (Address, Vec<u8>),
    Kick (PeerId),
}
