pub mod connection;
pub mod mirror;
pub mod session;

pub use connection::{connect_with_retry, SessionEvent};
pub use mirror::{ChunkMirror, DeltaOutcome};
pub use session::{ClientIdentity, SessionClient};
