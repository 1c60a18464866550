pub mod beacon;
pub mod mdns;
pub mod peer_directory;
pub mod service;

pub use beacon::{detect_local_ip, is_lan_address, Announcer, BeaconListener};
pub use peer_directory::{BeaconOutcome, PeerDirectory};
pub use service::{DiscoveryEvent, DiscoveryService};
