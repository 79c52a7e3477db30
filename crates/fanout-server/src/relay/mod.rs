//! Node-to-node relay: many sessions multiplexed over one connection per peer.

mod client;
mod conn;
mod link;
mod server;

pub use client::{RelayClient, dial};
pub use conn::SessionConn;
pub use link::RelayIo;
pub use server::RelayServer;
