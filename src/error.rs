use thiserror::Error;

/// Every failure the client can report.
///
/// Per-peer failures (`ProtocolError`, `PeerError`, `Io`) only ever close the
/// connection they happened on. `ParserError` and `StorageError` raised during
/// setup abort the whole run.
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// Malformed or unsupported torrent metadata
    #[error("parser error: {0}")]
    ParserError(String),

    /// Tracker unreachable or returned a failure
    #[error("tracker error: {0}")]
    TrackerError(String),

    /// Peer violated the wire protocol
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Connection refused, timed out or closed by the remote
    #[error("peer error: {0}")]
    PeerError(String),

    /// Output file could not be opened or written
    #[error("storage error: {0}")]
    StorageError(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApplicationError {
    /// Protocol violations, as opposed to plain transport trouble.
    pub fn is_protocol(&self) -> bool {
        matches!(self, ApplicationError::ProtocolError(_))
    }
}
