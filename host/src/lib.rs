pub mod broadcast_msg;
pub mod chunk_store;
pub mod client_process;
pub mod host;
pub mod lock_table;
pub mod server;
pub mod session_state;

pub use chunk_store::{ChunkDataProvider, JsonChunkStore, MemoryChunkStore, StoredChunk};
pub use host::{DisconnectReason, SessionHandle, SessionHost};
pub use server::HostServer;
