use std::fmt::Write;
use std::ops::Range;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

use super::error::WebSeedError;
use crate::torrent::FileLayout;

/// Characters left alone when escaping a file path. `/` separates
/// components and stays.
const PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'!')
    .remove(b'.')
    .remove(b'~')
    .remove(b'*')
    .remove(b'(')
    .remove(b')');

/// Percent-encodes a `/`-separated file path for use in a URL.
pub fn escape_path(path: &str) -> String {
    utf8_percent_encode(path, PATH).to_string()
}

/// Path of a file below the seed URL, as it appears on the wire.
///
/// Multi-file torrents live in a directory named after the torrent.
pub fn escaped_file_path(layout: &FileLayout, file_index: usize) -> Option<String> {
    let file = layout.file(file_index)?;
    let path = if layout.is_multi_file() {
        format!("{}/{}", layout.name(), file.path)
    } else {
        file.path.clone()
    };
    Some(escape_path(&path))
}

/// Parses a seed URL. Only plain `http` is spoken.
pub fn parse_seed_url(url: &str) -> Result<Url, WebSeedError> {
    let parsed = Url::parse(url).map_err(|e| WebSeedError::InvalidUrl(format!("{url}: {e}")))?;
    if parsed.scheme() != "http" {
        return Err(WebSeedError::InvalidUrl(format!(
            "{url}: unsupported scheme {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(WebSeedError::InvalidUrl(format!("{url}: no host")));
    }
    Ok(parsed)
}

/// The URL a file is fetched from.
///
/// A single-file seed URL names the file itself unless it ends in `/`, in
/// which case the file name is appended. Multi-file seed URLs always name
/// the directory holding the torrent.
pub fn file_url(seed: &Url, layout: &FileLayout, file_index: usize) -> Result<Url, WebSeedError> {
    let path = escaped_file_path(layout, file_index)
        .ok_or_else(|| WebSeedError::InvalidUrl(format!("no file {file_index}")))?;

    if !layout.is_multi_file() && !seed.path().ends_with('/') {
        return Ok(seed.clone());
    }
    let mut base = seed.clone();
    if !base.path().ends_with('/') {
        let dir = format!("{}/", base.path());
        base.set_path(&dir);
    }
    base.join(&path)
        .map_err(|e| WebSeedError::InvalidUrl(format!("{seed}{path}: {e}")))
}

/// Formats a `GET` for `range` (half-open) of the resource at `url`.
pub fn build_range_request(
    url: &Url,
    range: Range<u64>,
    user_agent: &str,
    extra_headers: &[(String, String)],
) -> String {
    let mut request = String::with_capacity(400);
    let _ = write!(request, "GET {}", url.path());
    if let Some(query) = url.query() {
        let _ = write!(request, "?{query}");
    }
    request.push_str(" HTTP/1.1\r\n");

    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => {
            let _ = write!(request, "Host: {host}:{port}\r\n");
        }
        None => {
            let _ = write!(request, "Host: {host}\r\n");
        }
    }
    if !user_agent.is_empty() {
        let _ = write!(request, "User-Agent: {user_agent}\r\n");
    }
    for (name, value) in extra_headers {
        let _ = write!(request, "{name}: {value}\r\n");
    }
    let _ = write!(
        request,
        "Range: bytes={}-{}\r\n\r\n",
        range.start,
        range.end.saturating_sub(1)
    );
    request
}
