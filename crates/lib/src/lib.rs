//! Relay core library: TCP broadcast relay, client registry, config, and status endpoint,
//! used by the `relay` CLI.

pub mod config;
pub mod error;
pub mod init;
pub mod relay;
pub mod status;

pub use error::RelayError;
pub use relay::{run_relay, run_relay_until, RelayServer};
