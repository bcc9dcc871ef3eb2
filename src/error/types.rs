use std::io;

use thiserror::Error;

/// Unified result type for the tunelink crate.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors surfaced by the messenger layers that callers may see directly.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("plugin `{plugin}` failed: {reason}")]
    Plugin { plugin: String, reason: String },
}

/// Socket endpoint failures.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// `closed` is true when the listening socket was torn down during the
    /// wait, which ends the current endpoint generation.
    #[error("accept failed (closed: {closed}): {reason}")]
    Accept { closed: bool, reason: String },
    #[error("connection reset by peer")]
    PeerReset,
    #[error("connection closed by peer")]
    PeerClosed,
    #[error("no client connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
}

impl EndpointError {
    /// Whether the error ends the listener loop for this endpoint generation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EndpointError::Accept { closed: true, .. }
                | EndpointError::PeerReset
                | EndpointError::PeerClosed
        )
    }
}

/// Runtime-side encoding failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("character {0:?} has no shifted wire byte")]
    Unencodable(char),
}

/// Failures inside the run iteration controller. These are logged, never
/// returned to the caller of `start()`/`stop()`.
#[derive(Debug, Error, PartialEq)]
pub enum TuningError {
    #[error("could not parse fitness value {raw:?}")]
    FitnessParse { raw: String },
    #[error("no payload was received before the next run")]
    MissingPayload,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
