//! Errors surfaced by the relay library before the server is running.

/// Configuration and address errors. Per-client I/O failures never reach this type;
/// they are logged and only end the affected connection.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("resolving {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} did not resolve to any address")]
    NoAddress(String),
}
