use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::error::WebSeedError;
use super::registry::RestartState;
use super::request::{build_range_request, escaped_file_path, file_url, parse_seed_url};
use crate::alert::Alert;
use crate::bandwidth::Direction;
use crate::constants::{BLOCK_SIZE, CONNECT_TIMEOUT, WEB_SEED_PREFERRED_REQUEST};
use crate::http::{is_ok_status, is_redirect, HttpParser};
use crate::peer::{
    run, Message, PeerConnection, PeerError, PeerId, PeerKind, PeerRequest, PeerWire,
    PieceReassembler, ProtocolError, ReceiveBuffer,
};
use crate::settings::PeerSettings;
use crate::torrent::Torrent;

/// One response the server owes us, or a pad file standing in for one.
#[derive(Debug, Clone)]
struct FileRequest {
    file_index: usize,
    /// Requested bytes, as offsets within the file.
    range: Range<u64>,
    /// Pad files are never fetched; their bytes are zeros.
    pad: bool,
    url: Option<Url>,
}

/// Position within the body of the response being read.
#[derive(Debug, Clone, Copy)]
struct BodyWindow {
    /// Leading bytes the server sent that were not asked for.
    skip: u64,
    /// Requested bytes still to come.
    remaining: u64,
}

/// A web seed (BEP-19): HTTP range requests around a [`PeerConnection`].
///
/// The seed has every piece and never chokes. Block requests from the core
/// are merged into large ranges, mapped onto the torrent's files and sent
/// as pipelined `GET`s; response bodies are cut back into blocks. A block
/// left half-received when the connection drops is stored on the torrent's
/// [`WebSeedList`](super::WebSeedList) and picked up by the next connection
/// to the same seed.
pub struct WebPeerConnection {
    core: PeerConnection,
    url: String,
    seed: Url,
    host: String,
    server: Option<String>,
    parser: HttpParser,
    /// Block-sized requests in the order their bytes arrive.
    requests: VecDeque<PeerRequest>,
    files: VecDeque<FileRequest>,
    piece: PieceReassembler,
    body: Option<BodyWindow>,
    restart: Option<RestartState>,
    closing: bool,
}

impl WebPeerConnection {
    pub fn new(mut core: PeerConnection, url: impl Into<String>, seed: Url) -> Self {
        let url = url.into();
        let piece_length = core.torrent().layout().piece_length().max(1);
        core.set_prefer_whole_pieces((WEB_SEED_PREFERRED_REQUEST / piece_length).max(1));
        core.set_request_large_blocks(true);

        let restart = core.torrent().web_seeds().take_restart(&url);
        let host = seed.host_str().unwrap_or_default().to_string();
        debug!(%url, restart = restart.is_some(), "web seed connection");
        Self {
            core,
            url,
            seed,
            host,
            server: None,
            parser: HttpParser::new(),
            requests: VecDeque::new(),
            files: VecDeque::new(),
            piece: PieceReassembler::new(),
            body: None,
            restart,
            closing: false,
        }
    }

    /// Marks the connection live and issues the first requests.
    pub fn start(&mut self) {
        let torrent = Arc::clone(self.core.torrent());
        let unavailable = torrent.web_seeds().unavailable(&self.url);
        let suggest = self.restart.as_ref().map(|s| s.request.piece);
        self.core
            .start_web_seed(PeerId::for_web_seed(&self.url), unavailable, suggest);
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `URL seed @ host (server)`, once the server named itself.
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Block requests whose bytes have not all arrived.
    pub fn outstanding(&self) -> impl Iterator<Item = &PeerRequest> {
        self.requests.iter()
    }

    /// Bytes held for the block currently being received.
    pub fn partial_len(&self) -> usize {
        self.piece.len()
    }

    fn write_request(&mut self, r: PeerRequest, out: &mut BytesMut) -> Result<(), PeerError> {
        let torrent = Arc::clone(self.core.torrent());
        let layout = torrent.layout();

        let mut skip = 0u32;
        let mut offset = 0;
        while offset < r.length {
            let sub = PeerRequest::new(r.piece, r.start + offset, BLOCK_SIZE.min(r.length - offset));
            if self.requests.is_empty() {
                let resumable = |s: &mut RestartState| {
                    s.request == sub && s.data.len() < sub.length as usize
                };
                if let Some(state) = self.restart.take_if(resumable) {
                    if self.piece.resume(sub, &state.data) {
                        skip = state.data.len() as u32;
                        debug!(
                            peer = %self.url,
                            request = %sub,
                            bytes = skip,
                            "resuming partial block"
                        );
                        self.core.set_receiving(self.piece.progress(BLOCK_SIZE));
                    }
                }
            }
            self.requests.push_back(sub);
            offset += sub.length;
        }

        let start = r.start + skip;
        let length = r.length - skip;
        if length == 0 {
            return Ok(());
        }

        let before = out.len();
        let headers = torrent.web_seeds().extra_headers(&self.url);
        let user_agent = self.core.settings().user_agent.clone();
        if layout.is_multi_file() {
            for slice in layout.map_block(r.piece, start, length) {
                let range = slice.offset..slice.offset + slice.size;
                let pad = layout
                    .file(slice.file_index)
                    .is_some_and(|f| f.is_padding);
                if pad {
                    self.files.push_back(FileRequest {
                        file_index: slice.file_index,
                        range,
                        pad: true,
                        url: None,
                    });
                    continue;
                }
                let url = file_url(&self.seed, layout, slice.file_index)?;
                trace!(peer = %self.url, %url, ?range, "==> GET");
                out.extend_from_slice(
                    build_range_request(&url, range.clone(), &user_agent, &headers).as_bytes(),
                );
                self.files.push_back(FileRequest {
                    file_index: slice.file_index,
                    range,
                    pad: false,
                    url: Some(url),
                });
            }
        } else {
            let first = r.piece as u64 * layout.piece_length() as u64 + start as u64;
            let range = first..first + length as u64;
            let url = file_url(&self.seed, layout, 0)?;
            trace!(peer = %self.url, %url, ?range, "==> GET");
            out.extend_from_slice(
                build_range_request(&url, range.clone(), &user_agent, &headers).as_bytes(),
            );
            self.files.push_back(FileRequest {
                file_index: 0,
                range,
                pad: false,
                url: Some(url),
            });
        }
        let sent = (out.len() - before) as u64;
        self.core.stats_mut().record(Direction::Upload, 0, sent);

        self.fill_pads()
    }

    /// Synthesizes pad files at the front of the queue.
    fn fill_pads(&mut self) -> Result<(), PeerError> {
        while self.files.front().is_some_and(|f| f.pad) {
            let Some(file) = self.files.pop_front() else {
                break;
            };
            let size = file.range.end - file.range.start;
            trace!(peer = %self.url, file = file.file_index, size, "pad file");
            self.fill_zeros(size)?;
        }
        Ok(())
    }

    fn fill_zeros(&mut self, mut count: u64) -> Result<(), PeerError> {
        while count > 0 && !self.core.is_disconnecting() {
            if !self.piece.is_active() {
                let Some(&front) = self.requests.front() else {
                    return Err(ProtocolError::UnexpectedData.into());
                };
                self.piece.start(front);
            }
            let want = (self.piece.remaining() as u64).min(count) as usize;
            count -= self.piece.fill_zeros(want) as u64;
            self.harvest()?;
        }
        self.core.set_receiving(self.piece.progress(BLOCK_SIZE));
        Ok(())
    }

    /// Cuts body bytes into blocks.
    ///
    /// A block already begun is topped up first. Whole blocks that follow
    /// are handed on directly. Leftover bytes begin the next block.
    fn deliver(&mut self, mut data: Bytes) -> Result<(), PeerError> {
        while !data.is_empty() && !self.core.is_disconnecting() {
            if self.piece.is_active() {
                let n = self.piece.remaining().min(data.len());
                self.piece.fill(&data.split_to(n));
                self.harvest()?;
                continue;
            }
            let Some(&front) = self.requests.front() else {
                return Err(ProtocolError::UnexpectedData.into());
            };
            let len = front.length as usize;
            if data.len() >= len {
                let block = data.split_to(len);
                self.requests.pop_front();
                self.complete_block(front, block)?;
            } else {
                self.piece.start(front);
                self.piece.fill(&data);
                data.clear();
            }
        }
        self.core.set_receiving(self.piece.progress(BLOCK_SIZE));
        Ok(())
    }

    fn harvest(&mut self) -> Result<(), PeerError> {
        let Some((r, data)) = self.piece.take() else {
            return Ok(());
        };
        self.requests.pop_front();
        self.complete_block(r, data)
    }

    fn complete_block(&mut self, r: PeerRequest, data: Bytes) -> Result<(), PeerError> {
        if self.core.is_disconnecting() {
            return Ok(());
        }
        match r.block(BLOCK_SIZE) {
            Some(block) if self.core.pipeline().contains(block) => {
                trace!(peer = %self.url, request = %r, "block received");
                self.core.incoming_piece(r, data)
            }
            _ => {
                // cancelled after the range was sent
                debug!(peer = %self.url, request = %r, "discarding block no longer requested");
                self.core.stats_mut().record_redundant(r.length as u64);
                Ok(())
            }
        }
    }

    fn on_headers(&mut self) -> Result<(), PeerError> {
        let status = self.parser.status_code().unwrap_or_default();
        debug!(
            peer = %self.url,
            status,
            message = self.parser.message(),
            "http response"
        );
        for (name, values) in self.parser.headers().iter_all() {
            trace!(peer = %self.url, "   {name}: {}", values.join(", "));
        }
        let torrent = Arc::clone(self.core.torrent());

        if !is_ok_status(status) {
            let retry_after = self
                .parser
                .header("retry-after")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(self.core.settings().web_seed_retry_default);
            torrent.web_seeds().retry(&self.url, retry_after);
            torrent.post_alert(Alert::UrlSeed {
                url: self.url.clone(),
                message: format!("{status} {}", self.parser.message()),
            });
            return Err(WebSeedError::ServiceUnavailable {
                status,
                retry_after,
            }
            .into());
        }

        if is_redirect(status) {
            return Err(self.redirect().into());
        }

        if let Some(server) = self.parser.header("server").filter(|s| !s.is_empty()) {
            let label = format!("URL seed @ {} ({server})", self.host);
            torrent.web_seeds().set_server(&self.url, label.clone());
            self.server = Some(label);
        }
        if self.parser.connection_close() {
            debug!(peer = %self.url, "server closes after this response");
            self.closing = true;
        }

        let Some(file) = self.files.front().cloned() else {
            return Err(WebSeedError::UnexpectedResponse.into());
        };
        let (start, end) = if status == 206 {
            match self.parser.content_range() {
                Some(range) => range,
                None => return Err(self.drop_seed(WebSeedError::InvalidRange).into()),
            }
        } else {
            match self.parser.content_length() {
                Some(len) => (0, len),
                None if self.parser.chunked_encoding() => (0, u64::MAX),
                None => return Err(self.drop_seed(WebSeedError::NoContentLength).into()),
            }
        };
        if start > file.range.start || end < file.range.end {
            return Err(self.range_violation(&file, file.range.start, start, end));
        }
        if status == 200 && file.range.start > 0 {
            debug!(peer = %self.url, skip = file.range.start, "server ignored the range");
        }
        self.body = Some(BodyWindow {
            skip: file.range.start - start,
            remaining: file.range.end - file.range.start,
        });
        Ok(())
    }

    /// Registers the new location and retires this seed.
    fn redirect(&mut self) -> WebSeedError {
        let torrent = Arc::clone(self.core.torrent());
        let Some(location) = self
            .parser
            .header("location")
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
        else {
            return self.drop_seed(WebSeedError::MissingLocation);
        };
        let Some(file) = self.files.front().cloned() else {
            return WebSeedError::UnexpectedResponse;
        };
        let base = file.url.unwrap_or_else(|| self.seed.clone());
        let mut target = match base.join(&location) {
            Ok(url) => url.to_string(),
            Err(_) => return self.drop_seed(WebSeedError::InvalidRedirection(location)),
        };

        let layout = torrent.layout();
        if layout.is_multi_file() {
            let path = escaped_file_path(layout, file.file_index).unwrap_or_default();
            match target.rfind(&path) {
                Some(i) if !path.is_empty() => target.truncate(i),
                _ => return self.drop_seed(WebSeedError::InvalidRedirection(target)),
            }
        }

        info!(from = %self.url, to = %target, "web seed redirected");
        let headers = torrent.web_seeds().extra_headers(&self.url);
        torrent.web_seeds().add(target.clone(), headers);
        torrent.web_seeds().remove(&self.url);
        torrent.post_alert(Alert::Redirected {
            from: self.url.clone(),
            to: target.clone(),
        });
        WebSeedError::Redirecting(target)
    }

    /// Removes the seed from the torrent for good.
    fn drop_seed(&self, error: WebSeedError) -> WebSeedError {
        warn!(peer = %self.url, %error, "dropping web seed");
        let torrent = self.core.torrent();
        torrent.web_seeds().remove(&self.url);
        torrent.post_alert(Alert::UrlSeed {
            url: self.url.clone(),
            message: error.to_string(),
        });
        error
    }

    /// The server does not have what was asked for. The pieces involved are
    /// not requested from this seed again.
    fn range_violation(&self, file: &FileRequest, expected: u64, start: u64, end: u64) -> PeerError {
        let torrent = self.core.torrent();
        let pieces = torrent.layout().pieces_in_file_range(
            file.file_index,
            file.range.start,
            file.range.end - file.range.start,
        );
        warn!(
            peer = %self.url,
            file = file.file_index,
            expected,
            start,
            end,
            ?pieces,
            "range violation"
        );
        torrent.web_seeds().mark_unavailable(&self.url, pieces);
        ProtocolError::RangeViolation {
            expected,
            start,
            end,
        }
        .into()
    }

    /// Feeds one batch of body bytes. Returns how many of them were payload.
    fn on_body(&mut self, mut data: Bytes) -> Result<u64, PeerError> {
        let Some(window) = self.body.as_mut() else {
            return Err(ProtocolError::UnexpectedData.into());
        };
        let skip = window.skip.min(data.len() as u64);
        window.skip -= skip;
        data.advance(skip as usize);
        let take = window.remaining.min(data.len() as u64);
        window.remaining -= take;
        data.truncate(take as usize);
        self.deliver(data)?;
        Ok(take)
    }

    fn on_response_end(&mut self) -> Result<(), PeerError> {
        let Some(file) = self.files.pop_front() else {
            return Err(WebSeedError::UnexpectedResponse.into());
        };
        if let Some(window) = self.body.take() {
            if window.remaining > 0 {
                let received = file.range.end - file.range.start - window.remaining;
                let expected = file.range.start + received;
                return Err(self.range_violation(&file, expected, file.range.start, expected));
            }
        }
        self.parser.reset();
        self.fill_pads()?;
        if self.closing {
            return Err(PeerError::ConnectionClosed);
        }
        Ok(())
    }

    fn record_download(&mut self, payload: u64, protocol: u64) {
        let (payload, protocol) = if self.core.settings().report_web_seed_downloads {
            (payload, protocol)
        } else {
            (0, payload + protocol)
        };
        self.core
            .stats_mut()
            .record(Direction::Download, payload, protocol);
    }
}

impl PeerWire for WebPeerConnection {
    fn connection(&self) -> &PeerConnection {
        &self.core
    }

    fn connection_mut(&mut self) -> &mut PeerConnection {
        &mut self.core
    }

    fn on_receive(&mut self, buf: &mut ReceiveBuffer) -> Result<(), PeerError> {
        self.core.mark_received(Instant::now());
        while !buf.is_empty() && !self.core.is_disconnecting() {
            if self.files.is_empty() {
                return Err(ProtocolError::UnexpectedData.into());
            }
            let had_headers = self.parser.header_finished();
            let plain = had_headers && !self.parser.chunked_encoding();
            // chunk headers sit between body bytes, so chunked bodies are copied out
            let mut copied = BytesMut::new();
            let progress = self.parser.incoming(buf.as_slice(), |data| {
                if !plain {
                    copied.extend_from_slice(data);
                }
            })?;
            let body = if self.parser.chunked_encoding() {
                buf.advance(progress.consumed());
                copied.freeze()
            } else {
                // a plain body is contiguous and follows everything else consumed
                buf.advance(progress.protocol);
                buf.consume(progress.payload)
            };

            if !had_headers && self.parser.header_finished() {
                if let Err(e) = self.on_headers() {
                    self.record_download(0, progress.consumed() as u64);
                    return Err(e);
                }
            }
            let payload = if body.is_empty() {
                0
            } else {
                self.on_body(body)?
            };
            self.record_download(payload, progress.consumed() as u64 - payload);

            if self.parser.is_finished() {
                self.on_response_end()?;
            }
            if progress.consumed() == 0 {
                break;
            }
        }
        Ok(())
    }

    fn fill_send_buffer(&mut self, out: &mut BytesMut) -> Result<(), PeerError> {
        if self.closing {
            return Ok(());
        }
        while let Some(message) = self.core.pop_outgoing() {
            // everything but requests is meaningless over HTTP
            if let Message::Request {
                index,
                begin,
                length,
            } = message
            {
                self.write_request(PeerRequest::new(index, begin, length), out)?;
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, error: &PeerError) {
        if self.core.is_disconnecting() {
            return;
        }
        let torrent = Arc::clone(self.core.torrent());
        match self.piece.take_partial() {
            Some((request, data)) if !data.is_empty() => {
                if let Some(unused) = self.restart.take() {
                    self.core
                        .stats_mut()
                        .record_redundant(unused.data.len() as u64);
                }
                torrent
                    .web_seeds()
                    .save_restart(&self.url, RestartState { request, data });
            }
            _ => {
                if let Some(unused) = self.restart.take() {
                    let done = torrent.have_piece(unused.request.piece)
                        || unused
                            .request
                            .block(BLOCK_SIZE)
                            .is_none_or(|b| torrent.picker().is_downloaded(b));
                    if done {
                        debug!(peer = %self.url, request = %unused.request, "dropping stale restart state");
                    } else {
                        torrent.web_seeds().save_restart(&self.url, unused);
                    }
                }
            }
        }
        self.requests.clear();
        self.files.clear();
        self.body = None;
        self.core.disconnect(error);
    }
}

/// Runs a web seed connection over an already connected stream.
pub async fn run_web_seed<S>(
    stream: S,
    torrent: Arc<Torrent>,
    settings: Arc<PeerSettings>,
    url: String,
) -> PeerError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let seed = match parse_seed_url(&url) {
        Ok(seed) => seed,
        Err(e) => {
            torrent.web_seeds().remove(&url);
            return e.into();
        }
    };
    let (handle, events) = torrent.router().register();
    let core = PeerConnection::new(
        Arc::clone(&torrent),
        settings,
        handle,
        url.clone(),
        PeerKind::WebSeed,
    );
    let mut wire = WebPeerConnection::new(core, url, seed);
    wire.start();
    run(stream, &mut wire, events).await
}

/// Connects to a web seed and runs the connection to completion.
///
/// Whether the seed is due for a connection is up to the caller; see
/// [`WebSeedList::ready`](super::WebSeedList::ready).
pub async fn connect_web_seed(
    torrent: Arc<Torrent>,
    settings: Arc<PeerSettings>,
    url: String,
) -> PeerError {
    let seed = match parse_seed_url(&url) {
        Ok(seed) => seed,
        Err(e) => {
            warn!(%url, error = %e, "unusable web seed");
            torrent.web_seeds().remove(&url);
            return e.into();
        }
    };
    let host = seed.host_str().unwrap_or_default().to_string();
    let port = seed.port_or_known_default().unwrap_or(80);
    debug!(%url, %host, port, "connecting to web seed");

    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return e.into(),
        Err(_) => return PeerError::Timeout,
    };
    let _ = stream.set_nodelay(true);
    let error = run_web_seed(stream, torrent, settings, url.clone()).await;
    info!(%url, %error, "web seed connection ended");
    error
}
