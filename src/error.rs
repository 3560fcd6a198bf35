//! Startup error types.
//!
//! Per-query failures never surface here; they are logged and answered
//! with an empty or FORMERR reply by the resolver.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that stop the proxy from starting.
#[derive(Debug, Error)]
pub enum Error {
    /// The blocklist file could not be read or parsed.
    #[error("failed to load blocklist {}: {}", path.display(), reason)]
    Blocklist { path: PathBuf, reason: String },

    /// A configured address is not a valid socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Binding a listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Terminal, signal or other process-level I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
