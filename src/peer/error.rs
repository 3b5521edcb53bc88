use thiserror::Error;

use super::piece::PeerRequest;
use crate::http::HttpError;
use crate::torrent::DiskError;
use crate::webseed::WebSeedError;

/// Errors that end a peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message ID.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// The connection was closed by the peer or by us.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Malformed HTTP from a web seed.
    #[error("http error: {0}")]
    Http(#[from] HttpError),

    /// A web seed refused, redirected or answered out of contract.
    #[error("web seed error: {0}")]
    WebSeed(#[from] WebSeedError),

    /// The disk collaborator failed.
    #[error("disk error: {0}")]
    Disk(#[from] DiskError),
}

/// Broad classification of a [`PeerError`], used to decide what happens to
/// the peer after the connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or out-of-contract data. Never retried on the connection.
    Protocol,
    /// Socket failure or timeout. The peer may be reconnected later.
    Transport,
    /// The web seed asked us to come back later.
    TransientServer,
    /// The web seed is unusable and is dropped from the candidate list.
    PermanentServer,
    /// Local storage failure.
    Disk,
    /// Orderly shutdown.
    Closed,
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerError::Io(_) | PeerError::Timeout => ErrorKind::Transport,
            PeerError::ConnectionClosed => ErrorKind::Closed,
            PeerError::Protocol(ProtocolError::SeedToSeed) => ErrorKind::Closed,
            PeerError::InvalidHandshake
            | PeerError::InfoHashMismatch
            | PeerError::InvalidMessage(_)
            | PeerError::InvalidMessageId(_)
            | PeerError::Protocol(_)
            | PeerError::Http(_) => ErrorKind::Protocol,
            PeerError::WebSeed(WebSeedError::Redirecting(_)) => ErrorKind::Closed,
            PeerError::WebSeed(e) if e.is_permanent() => ErrorKind::PermanentServer,
            PeerError::WebSeed(_) => ErrorKind::TransientServer,
            PeerError::Disk(_) => ErrorKind::Disk,
        }
    }
}

/// Ways a peer can break the wire contract.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("piece index {index} out of range ({num_pieces} pieces)")]
    InvalidPieceIndex { index: u32, num_pieces: u32 },

    #[error("bitfield of {got} bytes, expected {expected}")]
    BitfieldSizeMismatch { expected: usize, got: usize },

    #[error("invalid piece message ({0})")]
    InvalidPiece(PeerRequest),

    #[error("unsolicited piece ({0})")]
    UnsolicitedPiece(PeerRequest),

    #[error("too many invalid requests ({0})")]
    TooManyInvalidRequests(u32),

    #[error("{0} received without fast extension support")]
    FastExtensionNotSupported(&'static str),

    #[error("response range [{start}, {end}) does not cover expected offset {expected}")]
    RangeViolation { expected: u64, start: u64, end: u64 },

    #[error("http body received without an outstanding request")]
    UnexpectedData,

    #[error("both sides are seeds")]
    SeedToSeed,
}
