//! Relay: every chunk a client sends is forwarded unchanged to every other connected client.
//!
//! One reader and one writer task per client, joined by a bounded queue; the registry fans
//! chunks out without waiting on slow peers.

mod registry;
mod server;

pub use registry::{ClientId, ClientInfo, ClientRegistry, RelayStats};
pub use server::{resolve_addr, run_relay, run_relay_until, RelayServer};
