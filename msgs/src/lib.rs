pub mod beacon;
pub mod chunk;
pub mod client_server_msg;
pub mod codec;
pub mod config;
pub mod dequeue;
pub mod error;
pub mod lock;
pub mod logging;
pub mod model;
pub mod peer;
pub mod server_client_msg;
