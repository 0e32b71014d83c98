use std::net::SocketAddr;

use thiserror::Error;

/// Errors that abort worker or agent startup.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("could not resolve local host {0}")]
    UnresolvedLocalHost(String),

    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A failed push to a remote backend. Both variants make the current flush
/// fail and trigger back-off; the connector closes its socket.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("connection failed: {0}")]
    Connection(#[from] std::io::Error),

    #[error("remote rejected push: {0}")]
    Remote(String),
}
