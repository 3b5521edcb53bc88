use bytes::{BufMut, Bytes, BytesMut};

use super::error::HttpError;

/// A parsed chunk header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Size of the chunk data that follows. Zero ends the body.
    pub size: u64,
    /// Bytes taken by the header, including the CRLF that closed the
    /// previous chunk and, for the last chunk, the trailer section.
    pub len: usize,
    /// Trailer headers sent after the last chunk, keys lowercased.
    pub trailers: Vec<(String, String)>,
}

/// Parses the chunk header at the start of `buf`.
///
/// One leading CRLF (the end of the previous chunk's data) is skipped.
/// Returns `Ok(None)` until the whole header, and for the terminating
/// zero-size chunk the whole trailer section, is buffered.
pub fn parse_chunk_header(buf: &[u8]) -> Result<Option<ChunkHeader>, HttpError> {
    let mut pos = 0;
    if buf.get(pos) == Some(&b'\r') {
        pos += 1;
    }
    if buf.get(pos) == Some(&b'\n') {
        pos += 1;
    }
    if pos == buf.len() {
        return Ok(None);
    }
    let Some(line_end) = find_newline(buf, pos) else {
        return Ok(None);
    };

    let size = parse_chunk_size(trim_cr(&buf[pos..line_end]))?;
    let mut pos = line_end + 1;
    if size > 0 {
        return Ok(Some(ChunkHeader {
            size,
            len: pos,
            trailers: Vec::new(),
        }));
    }

    let mut trailers = Vec::new();
    loop {
        let Some(line_end) = find_newline(buf, pos) else {
            return Ok(None);
        };
        let line = trim_cr(&buf[pos..line_end]);
        pos = line_end + 1;
        if line.is_empty() {
            return Ok(Some(ChunkHeader {
                size: 0,
                len: pos,
                trailers,
            }));
        }
        trailers.push(split_header(line)?);
    }
}

/// Strips the chunk headers from a captured chunked body.
///
/// A body cut short keeps whatever payload it holds.
pub fn collapse_chunk_headers(body: &[u8]) -> Result<Bytes, HttpError> {
    let mut out = BytesMut::with_capacity(body.len());
    let mut pos = 0;
    while pos < body.len() {
        let Some(header) = parse_chunk_header(&body[pos..])? else {
            break;
        };
        pos += header.len;
        if header.size == 0 {
            break;
        }
        let end = usize::try_from(header.size)
            .ok()
            .and_then(|size| pos.checked_add(size))
            .map_or(body.len(), |end| end.min(body.len()));
        out.put_slice(&body[pos..end]);
        pos = end;
    }
    Ok(out.freeze())
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let token = match line.iter().position(|&b| b == b';') {
        Some(i) => &line[..i],
        None => line,
    };
    let token = token.trim_ascii();
    if token.is_empty() {
        return Err(HttpError::InvalidChunkHeader);
    }

    let mut size: u64 = 0;
    for &c in token {
        let digit = (c as char).to_digit(16).ok_or(HttpError::InvalidChunkHeader)?;
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit as u64))
            .ok_or(HttpError::ChunkSizeOverflow)?;
    }
    if size > i64::MAX as u64 {
        return Err(HttpError::ChunkSizeOverflow);
    }
    Ok(size)
}

pub(super) fn find_newline(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| from + i)
}

pub(super) fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Splits `Name: value` into a lowercased name and the trimmed value.
pub(super) fn split_header(line: &[u8]) -> Result<(String, String), HttpError> {
    let text = String::from_utf8_lossy(line);
    let Some((name, value)) = text.split_once(':') else {
        return Err(HttpError::MalformedHeader(text.into_owned()));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(HttpError::MalformedHeader(text.into_owned()));
    }
    Ok((
        name.to_ascii_lowercase(),
        value.trim_matches([' ', '\t']).to_string(),
    ))
}
