use multimap::MultiMap;
use tracing::trace;

use super::chunked::{find_newline, parse_chunk_header, split_header, trim_cr, ChunkHeader};
use super::error::HttpError;
use crate::constants::MAX_HTTP_LINE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    ReadStatus,
    ReadHeader,
    ReadBody,
    Finished,
    Error,
}

/// How the bytes of one [`HttpParser::incoming`] call were classified.
///
/// `payload + protocol` is the number of input bytes that belonged to the
/// current message. Anything past that starts the next message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub payload: usize,
    pub protocol: usize,
}

impl Progress {
    pub fn consumed(&self) -> usize {
        self.payload + self.protocol
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Plain,
    ChunkHeader,
    ChunkData(u64),
}

/// Incremental HTTP/1.x message parser.
///
/// Bytes can be fed in any split, down to one at a time; the result is the
/// same as feeding the whole message at once. Partial lines and chunk
/// headers are kept inside the parser, so the caller never re-feeds bytes.
///
/// ```
/// use seedwire::http::HttpParser;
///
/// let mut parser = HttpParser::new();
/// let mut body = Vec::new();
/// let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
/// let progress = parser
///     .incoming(response, |chunk| body.extend_from_slice(chunk))
///     .unwrap();
///
/// assert!(parser.is_finished());
/// assert_eq!(parser.status_code(), Some(200));
/// assert_eq!(progress.payload, 5);
/// assert_eq!(body, b"hello");
/// ```
#[derive(Debug)]
pub struct HttpParser {
    state: ParserState,
    body: Body,
    /// Partial status line, header line or chunk header.
    line: Vec<u8>,
    protocol: String,
    status_code: Option<u16>,
    message: String,
    method: String,
    path: String,
    headers: MultiMap<String, String>,
    content_length: Option<u64>,
    range: Option<(u64, u64)>,
    chunked: bool,
    connection_close: bool,
    body_received: u64,
    chunk_header_bytes: u64,
    chunk_sizes: Vec<u64>,
    error: Option<HttpError>,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::ReadStatus,
            body: Body::Plain,
            line: Vec::new(),
            protocol: String::new(),
            status_code: None,
            message: String::new(),
            method: String::new(),
            path: String::new(),
            headers: MultiMap::new(),
            content_length: None,
            range: None,
            chunked: false,
            connection_close: false,
            body_received: 0,
            chunk_header_bytes: 0,
            chunk_sizes: Vec::new(),
            error: None,
        }
    }

    /// Prepares for the next message on the same connection.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feeds newly received bytes.
    ///
    /// Body bytes, with any chunk headers removed, are handed to `on_body`
    /// in order. Parsing stops at the end of the message; the returned
    /// [`Progress`] tells how much of `data` was used. After an error the
    /// parser stays failed until [`reset`](Self::reset).
    pub fn incoming(
        &mut self,
        data: &[u8],
        mut on_body: impl FnMut(&[u8]),
    ) -> Result<Progress, HttpError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }

        let mut progress = Progress::default();
        let mut pos = 0;
        while pos < data.len() {
            let rest = &data[pos..];
            let step = match self.state {
                ParserState::ReadStatus | ParserState::ReadHeader => {
                    self.read_line(rest, &mut progress)
                }
                ParserState::ReadBody => self.read_body(rest, &mut progress, &mut on_body),
                ParserState::Finished | ParserState::Error => break,
            };
            match step {
                Ok(n) => pos += n,
                Err(e) => {
                    trace!(error = %e, "http parse error");
                    self.state = ParserState::Error;
                    self.error = Some(e.clone());
                    return Err(e);
                }
            }
        }
        Ok(progress)
    }

    fn read_line(&mut self, rest: &[u8], progress: &mut Progress) -> Result<usize, HttpError> {
        let Some(nl) = find_newline(rest, 0) else {
            if self.line.len() + rest.len() > MAX_HTTP_LINE {
                return Err(HttpError::LineTooLong(MAX_HTTP_LINE));
            }
            self.line.extend_from_slice(rest);
            progress.protocol += rest.len();
            return Ok(rest.len());
        };

        let used = nl + 1;
        self.line.extend_from_slice(&rest[..nl]);
        progress.protocol += used;
        if self.line.len() > MAX_HTTP_LINE {
            return Err(HttpError::LineTooLong(MAX_HTTP_LINE));
        }
        let line = std::mem::take(&mut self.line);
        let line = trim_cr(&line);
        match self.state {
            ParserState::ReadStatus => self.parse_status_line(line)?,
            _ => self.parse_header_line(line)?,
        }
        Ok(used)
    }

    fn parse_status_line(&mut self, line: &[u8]) -> Result<(), HttpError> {
        let text = String::from_utf8_lossy(line);
        let mut parts = text.splitn(3, ' ');
        let first = parts.next().unwrap_or_default();
        if first.is_empty() {
            return Err(HttpError::MalformedStatusLine(text.into_owned()));
        }

        if first.starts_with("HTTP/") {
            let code = parts
                .next()
                .filter(|c| c.len() == 3)
                .and_then(|c| c.parse::<u16>().ok())
                .filter(|c| (100..1000).contains(c))
                .ok_or_else(|| HttpError::MalformedStatusLine(text.to_string()))?;
            self.protocol = first.to_string();
            self.status_code = Some(code);
            self.message = parts.next().unwrap_or_default().trim().to_string();
        } else {
            let (Some(path), Some(protocol)) = (parts.next(), parts.next()) else {
                return Err(HttpError::MalformedStatusLine(text.into_owned()));
            };
            self.method = first.to_ascii_lowercase();
            self.path = path.to_string();
            self.protocol = protocol.trim().to_string();
        }
        self.state = ParserState::ReadHeader;
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), HttpError> {
        if line.is_empty() {
            self.end_of_headers();
            return Ok(());
        }

        let (name, value) = split_header(line)?;
        match name.as_str() {
            "content-length" => {
                let length = value
                    .parse::<u64>()
                    .map_err(|_| HttpError::InvalidContentLength(value.clone()))?;
                self.content_length = Some(length);
            }
            "content-range" => {
                let (start, end) = parse_content_range(&value)?;
                self.range = Some((start, end));
                self.content_length = Some(end - start);
            }
            "transfer-encoding" => {
                self.chunked = value.to_ascii_lowercase().contains("chunked");
            }
            _ => {}
        }
        self.headers.insert(name, value);
        Ok(())
    }

    fn end_of_headers(&mut self) {
        if self.status_code.is_some_and(|c| (100..200).contains(&c)) {
            // interim response, the real one follows
            trace!(status = ?self.status_code, "skipping informational response");
            self.headers.clear();
            self.content_length = None;
            self.range = None;
            self.chunked = false;
            self.status_code = None;
            self.message.clear();
            self.state = ParserState::ReadStatus;
            return;
        }

        let connection = self
            .header("connection")
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        self.connection_close = connection.contains("close")
            || (self.protocol == "HTTP/1.0" && !connection.contains("keep-alive"));

        if self.is_request() && !self.chunked && self.content_length.is_none() {
            self.content_length = Some(0);
        }

        self.state = ParserState::ReadBody;
        self.body = if self.chunked {
            Body::ChunkHeader
        } else {
            Body::Plain
        };
        if !self.chunked && self.content_length == Some(0) {
            self.state = ParserState::Finished;
        }
    }

    fn read_body(
        &mut self,
        rest: &[u8],
        progress: &mut Progress,
        on_body: &mut impl FnMut(&[u8]),
    ) -> Result<usize, HttpError> {
        match self.body {
            Body::Plain => {
                let n = match self.content_length {
                    Some(total) => clamp_len(total - self.body_received, rest.len()),
                    None => rest.len(),
                };
                self.deliver(&rest[..n], progress, on_body);
                if self.content_length == Some(self.body_received) {
                    self.state = ParserState::Finished;
                }
                Ok(n)
            }
            Body::ChunkData(remaining) => {
                let n = clamp_len(remaining, rest.len());
                self.deliver(&rest[..n], progress, on_body);
                let remaining = remaining - n as u64;
                self.body = if remaining == 0 {
                    Body::ChunkHeader
                } else {
                    Body::ChunkData(remaining)
                };
                Ok(n)
            }
            Body::ChunkHeader => {
                let (header, used) = match self.read_chunk_header(rest)? {
                    Some(parsed) => parsed,
                    None => {
                        progress.protocol += rest.len();
                        self.chunk_header_bytes += rest.len() as u64;
                        return Ok(rest.len());
                    }
                };
                progress.protocol += used;
                self.chunk_header_bytes += used as u64;
                self.chunk_sizes.push(header.size);

                if header.size == 0 {
                    for (name, value) in header.trailers {
                        self.headers.insert(name, value);
                    }
                    self.state = ParserState::Finished;
                } else {
                    self.body = Body::ChunkData(header.size);
                }
                Ok(used)
            }
        }
    }

    /// Parses a chunk header, continuing one left partial by an earlier call.
    ///
    /// Returns the header and how many bytes of `rest` it used, or `None`
    /// once all of `rest` has been stashed.
    fn read_chunk_header(
        &mut self,
        rest: &[u8],
    ) -> Result<Option<(ChunkHeader, usize)>, HttpError> {
        if self.line.is_empty() {
            if let Some(header) = parse_chunk_header(rest)? {
                let used = header.len;
                return Ok(Some((header, used)));
            }
            if rest.len() > MAX_HTTP_LINE {
                return Err(HttpError::LineTooLong(MAX_HTTP_LINE));
            }
            self.line.extend_from_slice(rest);
            return Ok(None);
        }

        let before = self.line.len();
        let room = (MAX_HTTP_LINE + 1).saturating_sub(before).max(1);
        let take = rest.len().min(room);
        self.line.extend_from_slice(&rest[..take]);
        match parse_chunk_header(&self.line)? {
            Some(header) => {
                let used = header.len.saturating_sub(before);
                self.line.clear();
                Ok(Some((header, used)))
            }
            None if self.line.len() > MAX_HTTP_LINE => Err(HttpError::LineTooLong(MAX_HTTP_LINE)),
            None => Ok(None),
        }
    }

    fn deliver(&mut self, data: &[u8], progress: &mut Progress, on_body: &mut impl FnMut(&[u8])) {
        if data.is_empty() {
            return;
        }
        on_body(data);
        progress.payload += data.len();
        self.body_received += data.len() as u64;
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Whether the status line and all headers have been parsed.
    pub fn header_finished(&self) -> bool {
        matches!(self.state, ParserState::ReadBody | ParserState::Finished)
    }

    pub fn is_finished(&self) -> bool {
        self.state == ParserState::Finished
    }

    pub fn is_request(&self) -> bool {
        !self.method.is_empty()
    }

    /// Status code of a response; `None` for requests or before the status
    /// line is in.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Reason phrase of the status line.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Lowercased request method.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// First value of a header. Names are matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Every value of a header, in the order received.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_vec(&name.to_ascii_lowercase())
            .map(|v| v.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn headers(&self) -> &MultiMap<String, String> {
        &self.headers
    }

    /// Body length from `Content-Length` or `Content-Range`.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// `Content-Range` as a half-open byte range.
    pub fn content_range(&self) -> Option<(u64, u64)> {
        self.range
    }

    pub fn chunked_encoding(&self) -> bool {
        self.chunked
    }

    /// Whether the server will close the connection after this message.
    pub fn connection_close(&self) -> bool {
        self.connection_close
    }

    /// Payload bytes delivered so far.
    pub fn body_received(&self) -> u64 {
        self.body_received
    }

    /// Body bytes still expected, if the length is known.
    pub fn body_remaining(&self) -> Option<u64> {
        self.content_length
            .map(|len| len.saturating_sub(self.body_received))
    }

    /// Bytes spent on chunk headers and trailers.
    pub fn chunk_header_bytes(&self) -> u64 {
        self.chunk_header_bytes
    }

    /// Sizes of the chunks parsed so far, the terminating zero included.
    pub fn chunk_sizes(&self) -> &[u64] {
        &self.chunk_sizes
    }
}

fn clamp_len(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |r| r.min(available))
}

/// Parses `bytes A-B/C` (the `bytes` unit is optional) into `[A, B + 1)`.
fn parse_content_range(value: &str) -> Result<(u64, u64), HttpError> {
    let invalid = || HttpError::InvalidContentRange(value.to_string());
    let spec = match value.get(..6) {
        Some(unit) if unit.eq_ignore_ascii_case("bytes ") => &value[6..],
        _ => value,
    };
    let spec = spec.trim();
    let range = spec.split('/').next().unwrap_or_default();
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    if end < start {
        return Err(invalid());
    }
    let end = end.checked_add(1).ok_or_else(invalid)?;
    Ok((start, end))
}
