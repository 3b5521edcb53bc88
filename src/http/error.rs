use thiserror::Error;

/// Malformed HTTP. Once a parser reports one of these it stays failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("malformed status line: {0}")]
    MalformedStatusLine(String),

    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),

    #[error("invalid content-range: {0}")]
    InvalidContentRange(String),

    #[error("invalid chunk header")]
    InvalidChunkHeader,

    #[error("chunk size overflows")]
    ChunkSizeOverflow,

    #[error("line longer than {0} bytes")]
    LineTooLong(usize),
}
