use super::*;

const RESPONSE: &[u8] = b"HTTP/1.1 206 Partial Content\r\n\
Server: test-server/1.0\r\n\
Content-Range: bytes 0-9/100\r\n\
X-Dup: a\r\n\
x-dup: b\r\n\
Content-Length: 10\r\n\
\r\n\
0123456789";

#[derive(Debug, PartialEq)]
struct Parsed {
    status: Option<u16>,
    message: String,
    content_length: Option<u64>,
    range: Option<(u64, u64)>,
    dup: Vec<String>,
    body: Vec<u8>,
    payload: usize,
    protocol: usize,
}

fn feed_in_steps(data: &[u8], step: usize) -> Parsed {
    let mut parser = HttpParser::new();
    let mut body = Vec::new();
    let mut payload = 0;
    let mut protocol = 0;
    for chunk in data.chunks(step) {
        let p = parser
            .incoming(chunk, |b| body.extend_from_slice(b))
            .unwrap();
        payload += p.payload;
        protocol += p.protocol;
    }
    assert!(parser.is_finished());
    Parsed {
        status: parser.status_code(),
        message: parser.message().to_string(),
        content_length: parser.content_length(),
        range: parser.content_range(),
        dup: parser
            .header_values("x-dup")
            .into_iter()
            .map(String::from)
            .collect(),
        body,
        payload,
        protocol,
    }
}

fn chunked_response(chunks: &[&[u8]]) -> Vec<u8> {
    let mut out = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    for chunk in chunks {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

#[test]
fn test_status_helpers() {
    assert!(is_ok_status(200));
    assert!(is_ok_status(206));
    assert!(is_ok_status(301));
    assert!(!is_ok_status(204));
    assert!(!is_ok_status(503));
    assert!(is_redirect(307));
    assert!(!is_redirect(200));
}

#[test]
fn test_parse_response_all_at_once() {
    let parsed = feed_in_steps(RESPONSE, RESPONSE.len());
    assert_eq!(parsed.status, Some(206));
    assert_eq!(parsed.message, "Partial Content");
    assert_eq!(parsed.range, Some((0, 10)));
    assert_eq!(parsed.content_length, Some(10));
    assert_eq!(parsed.dup, vec!["a", "b"]);
    assert_eq!(parsed.body, b"0123456789");
    assert_eq!(parsed.payload, 10);
    assert_eq!(parsed.payload + parsed.protocol, RESPONSE.len());
}

#[test]
fn test_byte_at_a_time_matches_all_at_once() {
    let whole = feed_in_steps(RESPONSE, RESPONSE.len());
    for step in [1, 2, 3, 7, 16] {
        assert_eq!(feed_in_steps(RESPONSE, step), whole, "step {step}");
    }

    let chunked = chunked_response(&[&b"hello "[..], &b"chunked "[..], &b"world"[..]]);
    let whole = feed_in_steps(&chunked, chunked.len());
    assert_eq!(whole.body, b"hello chunked world");
    assert_eq!(whole.payload + whole.protocol, chunked.len());
    for step in [1, 2, 5] {
        assert_eq!(feed_in_steps(&chunked, step), whole, "step {step}");
    }
}

#[test]
fn test_header_accessors() {
    let mut parser = HttpParser::new();
    parser.incoming(RESPONSE, |_| {}).unwrap();
    assert_eq!(parser.header("server"), Some("test-server/1.0"));
    assert_eq!(parser.header("SERVER"), Some("test-server/1.0"));
    assert_eq!(parser.header("missing"), None);
    assert_eq!(parser.protocol(), "HTTP/1.1");
    assert!(!parser.connection_close());
    assert!(!parser.chunked_encoding());
    assert_eq!(parser.body_remaining(), Some(0));
}

#[test]
fn test_stops_at_message_end() {
    let mut data = RESPONSE.to_vec();
    data.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    let mut parser = HttpParser::new();
    let progress = parser.incoming(&data, |_| {}).unwrap();
    assert_eq!(progress.consumed(), RESPONSE.len());

    // the rest belongs to the next response
    parser.reset();
    let rest = &data[progress.consumed()..];
    let progress = parser.incoming(rest, |_| {}).unwrap();
    assert_eq!(progress.protocol, rest.len());
    assert_eq!(parser.status_code(), Some(200));
    assert_eq!(parser.state(), ParserState::ReadHeader);
}

#[test]
fn test_reset_clears_previous_response() {
    let mut parser = HttpParser::new();
    let first = chunked_response(&[&b"abc"[..]]);
    parser.incoming(b"HTTP/1.0 200 OK\r\nX-Old: 1\r\n", |_| {}).unwrap();
    parser.reset();
    parser.incoming(&first, |_| {}).unwrap();
    assert!(parser.chunked_encoding());
    assert_eq!(parser.chunk_sizes(), &[3, 0]);

    parser.reset();
    let second = b"HTTP/1.1 404 Not Found\r\nContent-Length: 3\r\n\r\nnop";
    let mut body = Vec::new();
    let progress = parser
        .incoming(second, |b| body.extend_from_slice(b))
        .unwrap();

    assert_eq!(parser.status_code(), Some(404));
    assert!(!parser.chunked_encoding());
    assert!(parser.chunk_sizes().is_empty());
    assert_eq!(parser.chunk_header_bytes(), 0);
    assert_eq!(parser.header("x-old"), None);
    assert_eq!(parser.header("transfer-encoding"), None);
    assert_eq!(parser.content_range(), None);
    assert!(!parser.connection_close());
    assert_eq!(parser.body_received(), 3);
    assert_eq!(body, b"nop");
    assert_eq!(progress.consumed(), second.len());
}

#[test]
fn test_chunked_round_trip() {
    let chunks: Vec<Vec<u8>> = (1..=6).map(|n| vec![n as u8; n * 100]).collect();
    let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
    let response = chunked_response(&refs);

    let mut parser = HttpParser::new();
    let mut body = Vec::new();
    let progress = parser
        .incoming(&response, |b| body.extend_from_slice(b))
        .unwrap();

    assert_eq!(body, chunks.concat());
    assert!(parser.is_finished());
    let sizes = parser.chunk_sizes();
    assert_eq!(sizes.iter().filter(|&&s| s == 0).count(), 1);
    assert_eq!(sizes.last(), Some(&0));
    assert_eq!(&sizes[..6], &[100, 200, 300, 400, 500, 600]);
    assert_eq!(progress.consumed(), response.len());
}

#[test]
fn test_split_chunk_header() {
    let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
    let tail = b"1234567890\r\n0\r\n\r\n";

    let mut whole = HttpParser::new();
    let mut body_whole = Vec::new();
    let mut joined = head.to_vec();
    joined.extend_from_slice(b"a\r\n");
    joined.extend_from_slice(tail);
    whole
        .incoming(&joined, |b| body_whole.extend_from_slice(b))
        .unwrap();

    let mut split = HttpParser::new();
    let mut body_split = Vec::new();
    let mut protocol = 0;
    let mut payload = 0;
    for part in [&head[..], &b"a\r"[..], &b"\n"[..], &tail[..]] {
        let p = split
            .incoming(part, |b| body_split.extend_from_slice(b))
            .unwrap();
        protocol += p.protocol;
        payload += p.payload;
    }

    assert_eq!(body_split, b"1234567890");
    assert_eq!(body_split, body_whole);
    assert_eq!(split.chunk_sizes(), whole.chunk_sizes());
    assert_eq!(split.chunk_header_bytes(), whole.chunk_header_bytes());
    assert_eq!(protocol + payload, joined.len());
    assert!(split.is_finished());
}

#[test]
fn test_chunk_trailers_become_headers() {
    let response =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Checksum: 42\r\n\r\n";
    let mut parser = HttpParser::new();
    parser.incoming(response, |_| {}).unwrap();
    assert!(parser.is_finished());
    assert_eq!(parser.header("x-checksum"), Some("42"));
}

#[test]
fn test_parse_chunk_header() {
    assert_eq!(parse_chunk_header(b"").unwrap(), None);
    assert_eq!(parse_chunk_header(b"\r\n").unwrap(), None);
    assert_eq!(parse_chunk_header(b"1f").unwrap(), None);

    let h = parse_chunk_header(b"1f;name=value\r\nrest").unwrap().unwrap();
    assert_eq!(h.size, 31);
    assert_eq!(h.len, 15);

    let h = parse_chunk_header(b"\r\nA\r\n").unwrap().unwrap();
    assert_eq!(h.size, 10);
    assert_eq!(h.len, 5);

    // the last chunk waits for the end of the trailers
    assert_eq!(parse_chunk_header(b"0\r\n").unwrap(), None);
    let h = parse_chunk_header(b"0\r\n\r\n").unwrap().unwrap();
    assert_eq!(h.size, 0);
    assert_eq!(h.len, 5);
}

#[test]
fn test_malformed_chunk_header_is_sticky() {
    let mut parser = HttpParser::new();
    let bad = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
    assert_eq!(
        parser.incoming(bad, |_| {}),
        Err(HttpError::InvalidChunkHeader)
    );
    assert_eq!(parser.state(), ParserState::Error);
    assert!(parser.incoming(b"5\r\nhello", |_| {}).is_err());
}

#[test]
fn test_chunk_size_overflow() {
    assert_eq!(
        parse_chunk_header(b"8000000000000000\r\n"),
        Err(HttpError::ChunkSizeOverflow)
    );
    assert_eq!(
        parse_chunk_header(b"fffffffffffffffffff\r\n"),
        Err(HttpError::ChunkSizeOverflow)
    );
    assert!(parse_chunk_header(b"7fffffffffffffff\r\n").is_ok());
}

#[test]
fn test_collapse_chunk_headers() {
    let body = b"5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n";
    assert_eq!(&collapse_chunk_headers(body).unwrap()[..], b"hello, world");

    // cut short inside the second chunk
    assert_eq!(
        &collapse_chunk_headers(&body[..15]).unwrap()[..],
        b"hello, "
    );
    assert!(collapse_chunk_headers(b"x\r\n").is_err());
}

#[test]
fn test_continue_is_skipped() {
    let response = b"HTTP/1.1 100 Continue\r\nX-Interim: yes\r\n\r\n\
HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    let mut parser = HttpParser::new();
    let mut body = Vec::new();
    let progress = parser
        .incoming(response, |b| body.extend_from_slice(b))
        .unwrap();
    assert_eq!(parser.status_code(), Some(200));
    assert_eq!(parser.header("x-interim"), None);
    assert_eq!(body, b"ok");
    assert_eq!(progress.consumed(), response.len());
}

#[test]
fn test_request_line() {
    let mut parser = HttpParser::new();
    let request = b"GET /files/a%20b.bin HTTP/1.1\r\nHost: example.com\r\nRange: bytes=0-99\r\n\r\n";
    let progress = parser.incoming(request, |_| {}).unwrap();
    assert!(parser.is_request());
    assert!(parser.is_finished());
    assert_eq!(parser.method(), "get");
    assert_eq!(parser.path(), "/files/a%20b.bin");
    assert_eq!(parser.status_code(), None);
    assert_eq!(parser.header("range"), Some("bytes=0-99"));
    assert_eq!(progress.protocol, request.len());
}

#[test]
fn test_connection_close() {
    let mut parser = HttpParser::new();
    parser
        .incoming(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n", |_| {})
        .unwrap();
    assert!(parser.connection_close());

    parser.reset();
    parser
        .incoming(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n", |_| {})
        .unwrap();
    assert!(parser.connection_close());

    parser.reset();
    parser
        .incoming(b"HTTP/1.0 200 OK\r\nConnection: Keep-Alive\r\nContent-Length: 0\r\n\r\n", |_| {})
        .unwrap();
    assert!(!parser.connection_close());
}

#[test]
fn test_body_without_length_reads_until_close() {
    let mut parser = HttpParser::new();
    let mut body = Vec::new();
    parser
        .incoming(b"HTTP/1.1 200 OK\r\n\r\nabc", |b| body.extend_from_slice(b))
        .unwrap();
    parser
        .incoming(b"def", |b| body.extend_from_slice(b))
        .unwrap();
    assert_eq!(parser.content_length(), None);
    assert!(!parser.is_finished());
    assert_eq!(body, b"abcdef");
}

fn parse_error(input: &[u8]) -> HttpError {
    let mut parser = HttpParser::new();
    parser.incoming(input, |_| {}).unwrap_err()
}

#[test]
fn test_malformed_input() {
    assert!(matches!(
        parse_error(b"\r\n"),
        HttpError::MalformedStatusLine(_)
    ));
    assert!(matches!(
        parse_error(b"HTTP/1.1 2x0 OK\r\n"),
        HttpError::MalformedStatusLine(_)
    ));
    assert!(matches!(
        parse_error(b"HTTP/1.1 200 OK\r\nno colon here\r\n"),
        HttpError::MalformedHeader(_)
    ));
    assert!(matches!(
        parse_error(b"HTTP/1.1 200 OK\r\nContent-Length: many\r\n"),
        HttpError::InvalidContentLength(_)
    ));
    assert!(matches!(
        parse_error(b"HTTP/1.1 206 OK\r\nContent-Range: bytes 10-5/100\r\n"),
        HttpError::InvalidContentRange(_)
    ));
    assert!(matches!(
        parse_error(b"HTTP/1.1 206 OK\r\nContent-Range: bytes x-5/100\r\n"),
        HttpError::InvalidContentRange(_)
    ));
}

#[test]
fn test_content_range_without_unit() {
    let mut parser = HttpParser::new();
    parser
        .incoming(b"HTTP/1.1 206 OK\r\nContent-Range: 100-199/1000\r\n\r\n", |_| {})
        .unwrap();
    assert_eq!(parser.content_range(), Some((100, 200)));
    assert_eq!(parser.content_length(), Some(100));
}

#[test]
fn test_overlong_line() {
    let mut parser = HttpParser::new();
    let long = vec![b'a'; crate::constants::MAX_HTTP_LINE + 1];
    assert!(matches!(
        parser.incoming(&long, |_| {}),
        Err(HttpError::LineTooLong(_))
    ));
}
