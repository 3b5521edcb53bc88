//! Incremental HTTP/1.x response parsing for web seeds.
//!
//! [`HttpParser`] is fed bytes as they come off the socket and reports, for
//! every call, how many of the new bytes were payload and how many were
//! protocol overhead (status line, headers, chunk headers). Chunked transfer
//! encoding is decoded on the fly.

mod chunked;
mod error;
mod parser;

pub use chunked::{collapse_chunk_headers, parse_chunk_header, ChunkHeader};
pub use error::HttpError;
pub use parser::{HttpParser, ParserState, Progress};

/// Status codes a web seed may answer with: 200, 206 and redirects.
pub fn is_ok_status(status: u16) -> bool {
    status == 200 || status == 206 || is_redirect(status)
}

pub fn is_redirect(status: u16) -> bool {
    (300..400).contains(&status)
}

#[cfg(test)]
mod tests;
