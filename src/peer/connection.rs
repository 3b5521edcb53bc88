use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::bitfield::Bitfield;
use super::choking::ChokingState;
use super::error::{ErrorKind, PeerError, ProtocolError};
use super::message::Message;
use super::peer_id::PeerId;
use super::piece::{PeerRequest, PendingBlock, PieceBlock, PieceBlockProgress};
use super::pipeline::{CancelOutcome, RequestPipeline};
use super::stats::TransferStats;
use super::table::{ConnectionEvent, ConnectionHandle};
use crate::alert::Alert;
use crate::constants::{
    BLOCK_SIZE, KEEPALIVE_INTERVAL, MAX_SUGGESTED_PIECES, RATE_CALC_WINDOW, TICK_INTERVAL,
};
use crate::settings::PeerSettings;
use crate::torrent::{DiskError, Torrent};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connection in progress.
    Connecting,
    /// Connected, performing the handshake.
    Handshaking,
    /// Ready for data exchange.
    Established,
    /// Torn down; every further call is a no-op.
    Disconnecting,
}

/// Which transport sits below the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    BitTorrent,
    WebSeed,
}

/// The peer-wire state machine shared by every transport.
///
/// A `PeerConnection` performs no I/O. Transports feed it decoded messages
/// through the `incoming_*` handlers and drain the messages it wants to send
/// with [`pop_outgoing`](Self::pop_outgoing). Disk completions and torrent
/// notifications arrive as [`ConnectionEvent`]s through
/// [`handle_event`](Self::handle_event).
///
/// Handlers return `Err` for anything that must end the connection; the
/// caller then runs [`disconnect`](Self::disconnect).
pub struct PeerConnection {
    torrent: Arc<Torrent>,
    settings: Arc<PeerSettings>,
    handle: ConnectionHandle,
    label: String,
    kind: PeerKind,
    state: ConnectionState,
    peer_id: Option<PeerId>,
    choking: ChokingState,
    peer_pieces: Bitfield,
    bitfield_received: bool,
    supports_fast: bool,
    pipeline: RequestPipeline,
    prefer_whole_pieces: u32,
    request_large_blocks: bool,
    /// Requests the peer made of us, not yet read from disk.
    upload_queue: VecDeque<PeerRequest>,
    /// Requests being read from disk.
    pending_reads: Vec<PeerRequest>,
    reading_bytes: usize,
    allowed_fast: Vec<u32>,
    suggested: VecDeque<u32>,
    outbox: VecDeque<Message>,
    outbox_bytes: usize,
    stats: TransferStats,
    invalid_requests: u32,
    queued_disk_bytes: usize,
    receiving: Option<PieceBlockProgress>,
    last_receive: Instant,
    last_sent: Instant,
}

impl PeerConnection {
    pub fn new(
        torrent: Arc<Torrent>,
        settings: Arc<PeerSettings>,
        handle: ConnectionHandle,
        label: impl Into<String>,
        kind: PeerKind,
    ) -> Self {
        let now = Instant::now();
        let num_pieces = torrent.num_pieces() as usize;
        Self {
            pipeline: RequestPipeline::new(&settings),
            torrent,
            settings,
            handle,
            label: label.into(),
            kind,
            state: ConnectionState::Connecting,
            peer_id: None,
            choking: ChokingState::default(),
            peer_pieces: Bitfield::new(num_pieces),
            bitfield_received: false,
            supports_fast: false,
            prefer_whole_pieces: 0,
            request_large_blocks: false,
            upload_queue: VecDeque::new(),
            pending_reads: Vec::new(),
            reading_bytes: 0,
            allowed_fast: Vec::new(),
            suggested: VecDeque::new(),
            outbox: VecDeque::new(),
            outbox_bytes: 0,
            stats: TransferStats::new(RATE_CALC_WINDOW, TICK_INTERVAL),
            invalid_requests: 0,
            queued_disk_bytes: 0,
            receiving: None,
            last_receive: now,
            last_sent: now,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Address or URL used in logs and alerts.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state == ConnectionState::Disconnecting
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn choking(&self) -> ChokingState {
        self.choking
    }

    pub fn peer_pieces(&self) -> &Bitfield {
        &self.peer_pieces
    }

    /// Whether the peer has every piece.
    pub fn is_peer_seed(&self) -> bool {
        self.peer_pieces.is_complete()
    }

    pub fn supports_fast(&self) -> bool {
        self.supports_fast
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut TransferStats {
        &mut self.stats
    }

    pub fn settings(&self) -> &Arc<PeerSettings> {
        &self.settings
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.torrent
    }

    pub fn upload_queue_len(&self) -> usize {
        self.upload_queue.len() + self.pending_reads.len()
    }

    pub fn allowed_fast(&self) -> &[u32] {
        &self.allowed_fast
    }

    pub fn suggested(&self) -> impl Iterator<Item = &u32> {
        self.suggested.iter()
    }

    pub fn invalid_requests(&self) -> u32 {
        self.invalid_requests
    }

    pub fn queued_disk_bytes(&self) -> usize {
        self.queued_disk_bytes
    }

    /// The block currently being received, if any.
    pub fn downloading_piece_progress(&self) -> Option<PieceBlockProgress> {
        self.receiving
    }

    pub fn set_receiving(&mut self, progress: Option<PieceBlockProgress>) {
        self.receiving = progress;
    }

    /// Number of whole pieces to pick at once; zero picks single blocks.
    pub fn set_prefer_whole_pieces(&mut self, pieces: u32) {
        self.prefer_whole_pieces = pieces;
    }

    /// Merge adjacent blocks into one request message.
    pub fn set_request_large_blocks(&mut self, enabled: bool) {
        self.request_large_blocks = enabled;
    }

    /// Swaps in a new settings snapshot.
    pub fn reconfigure(&mut self, settings: Arc<PeerSettings>) {
        self.pipeline.reconfigure(&settings);
        self.settings = settings;
    }

    /// Whether the transport may read more from the socket.
    pub fn can_read(&self) -> bool {
        self.state != ConnectionState::Disconnecting
            && self.queued_disk_bytes < self.settings.max_queued_disk_bytes
    }

    /// Records socket activity.
    pub fn mark_received(&mut self, now: Instant) {
        self.last_receive = now;
    }

    // ========================================================================
    // Outgoing messages
    // ========================================================================

    fn send(&mut self, message: Message) {
        trace!(peer = %self.label, ?message, "queue message");
        self.outbox_bytes += message.wire_len();
        self.outbox.push_back(message);
    }

    /// Takes the next message to put on the wire.
    pub fn pop_outgoing(&mut self) -> Option<Message> {
        let message = self.outbox.pop_front()?;
        self.outbox_bytes = self.outbox_bytes.saturating_sub(message.wire_len());
        self.last_sent = Instant::now();
        Some(message)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Bytes queued for sending.
    pub fn send_buffer_size(&self) -> usize {
        self.outbox_bytes
    }

    pub fn send_choke(&mut self) {
        if self.choking.am_choking {
            return;
        }
        self.choking.am_choking = true;
        self.send(Message::Choke);

        let queued: Vec<PeerRequest> = self
            .upload_queue
            .drain(..)
            .chain(self.pending_reads.drain(..))
            .collect();
        self.reading_bytes = 0;
        if self.supports_fast {
            for r in queued {
                self.send(Message::reject(r));
            }
        }
    }

    pub fn send_unchoke(&mut self) {
        if !self.choking.am_choking {
            return;
        }
        self.choking.am_choking = false;
        self.send(Message::Unchoke);
    }

    pub fn send_interested(&mut self) {
        if self.choking.am_interested {
            return;
        }
        self.choking.am_interested = true;
        self.send(Message::Interested);
    }

    pub fn send_not_interested(&mut self) {
        if !self.choking.am_interested {
            return;
        }
        self.choking.am_interested = false;
        self.send(Message::NotInterested);
    }

    pub fn send_have(&mut self, piece: u32) {
        self.send(Message::Have { piece });
    }

    /// Sends what we have: have-all/have-none with the fast extension,
    /// a bitfield otherwise (omitted when empty).
    fn send_bitfield(&mut self) {
        let have = self.torrent.have_bitfield();
        if self.supports_fast {
            if have.is_complete() {
                self.send(Message::HaveAll);
                return;
            }
            if have.is_empty() {
                self.send(Message::HaveNone);
                return;
            }
        } else if have.is_empty() {
            return;
        }
        self.send(Message::Bitfield(have.to_bytes()));
    }

    /// Sends interested or not-interested to match what the peer has.
    pub fn update_interest(&mut self) {
        let torrent = Arc::clone(&self.torrent);
        let interesting = self
            .peer_pieces
            .iter_set()
            .any(|p| !torrent.have_piece(p as u32) && torrent.picker().is_wanted(p as u32));
        if interesting {
            self.send_interested();
        } else {
            self.send_not_interested();
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn set_handshaking(&mut self) {
        self.state = ConnectionState::Handshaking;
    }

    /// The peer's handshake checked out; the connection is live.
    pub fn on_handshake(&mut self, peer_id: PeerId, supports_fast: bool) {
        debug!(peer = %self.label, ?peer_id, supports_fast, "handshake complete");
        self.peer_id = Some(peer_id);
        self.supports_fast = supports_fast;
        self.state = ConnectionState::Established;
        self.send_bitfield();
    }

    /// Brings up a web seed: it has every piece it is not known to lack and
    /// never chokes. `suggest` is picked first, typically the piece a
    /// previous connection left a partial block in.
    pub fn start_web_seed(
        &mut self,
        peer_id: PeerId,
        unavailable: impl IntoIterator<Item = u32>,
        suggest: Option<u32>,
    ) {
        self.peer_id = Some(peer_id);
        self.state = ConnectionState::Established;
        self.choking = ChokingState::web_seed();
        self.choking.am_interested = false;
        self.peer_pieces.set_all();
        for piece in unavailable {
            self.peer_pieces.clear_piece(piece as usize);
        }
        if let Some(piece) = suggest.filter(|&p| p < self.torrent.num_pieces()) {
            self.suggested.push_back(piece);
        }
        self.pipeline.reset_timers(Instant::now());
        self.update_interest();
        self.request_more();
    }

    /// Runs the teardown sequence.
    ///
    /// Every pending block goes back to the picker first, then the handle is
    /// unregistered so late completions are dropped, then buffers are
    /// released. Calling it again has no effect.
    pub fn disconnect(&mut self, error: &PeerError) {
        if self.state == ConnectionState::Disconnecting {
            return;
        }
        self.state = ConnectionState::Disconnecting;
        debug!(peer = %self.label, %error, "disconnecting");

        let torrent = Arc::clone(&self.torrent);
        for b in self.pipeline.clear() {
            if b.is_active() {
                torrent.picker().abort_download(b.block);
            }
        }

        torrent.router().unregister(self.handle);
        self.upload_queue.clear();
        self.pending_reads.clear();
        self.reading_bytes = 0;

        self.outbox.clear();
        self.outbox_bytes = 0;
        self.receiving = None;

        let alert = match error.kind() {
            ErrorKind::Protocol => Alert::PeerError {
                peer: self.label.clone(),
                message: error.to_string(),
            },
            _ => Alert::PeerDisconnected {
                peer: self.label.clone(),
                reason: error.to_string(),
            },
        };
        torrent.post_alert(alert);
    }

    // ========================================================================
    // Incoming messages
    // ========================================================================

    pub fn incoming_message(&mut self, message: Message) -> Result<(), PeerError> {
        if self.state != ConnectionState::Established {
            return Err(PeerError::InvalidMessage(
                "message before handshake".into(),
            ));
        }
        trace!(peer = %self.label, ?message, "incoming message");
        match message {
            Message::KeepAlive => Ok(()),
            Message::Choke => self.incoming_choke(),
            Message::Unchoke => self.incoming_unchoke(),
            Message::Interested => self.incoming_interested(),
            Message::NotInterested => self.incoming_not_interested(),
            Message::Have { piece } => self.incoming_have(piece),
            Message::Bitfield(bits) => self.incoming_bitfield(&bits),
            Message::Request {
                index,
                begin,
                length,
            } => self.incoming_request(PeerRequest::new(index, begin, length)),
            Message::Piece { index, begin, data } => {
                let r = PeerRequest::new(index, begin, data.len() as u32);
                self.incoming_piece(r, data)
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => self.incoming_cancel(PeerRequest::new(index, begin, length)),
            Message::Suggest { piece } => self.incoming_suggest(piece),
            Message::HaveAll => self.incoming_have_all(),
            Message::HaveNone => self.incoming_have_none(),
            Message::Reject {
                index,
                begin,
                length,
            } => self.incoming_reject(PeerRequest::new(index, begin, length)),
            Message::AllowedFast { piece } => self.incoming_allowed_fast(piece),
        }
    }

    /// The peer stopped serving us. Every request is handed back to the
    /// picker, except allowed-fast ones on fast-extension peers.
    pub fn incoming_choke(&mut self) -> Result<(), PeerError> {
        self.choking.peer_choking = true;

        let keep_fast = self.supports_fast;
        let allowed = self.allowed_fast.clone();
        let removed = self
            .pipeline
            .clear_except(|b| keep_fast && allowed.contains(&b.block.piece_index));
        let torrent = Arc::clone(&self.torrent);
        for b in removed {
            if b.is_active() {
                torrent.picker().abort_download(b.block);
            }
        }
        Ok(())
    }

    pub fn incoming_unchoke(&mut self) -> Result<(), PeerError> {
        if !self.choking.peer_choking {
            return Ok(());
        }
        self.choking.peer_choking = false;
        self.pipeline.reset_timers(Instant::now());
        self.request_more();
        Ok(())
    }

    pub fn incoming_interested(&mut self) -> Result<(), PeerError> {
        self.choking.peer_interested = true;
        Ok(())
    }

    pub fn incoming_not_interested(&mut self) -> Result<(), PeerError> {
        self.choking.peer_interested = false;
        self.upload_queue.clear();
        self.pending_reads.clear();
        self.reading_bytes = 0;
        Ok(())
    }

    pub fn incoming_have(&mut self, index: u32) -> Result<(), PeerError> {
        let num_pieces = self.torrent.num_pieces();
        if index >= num_pieces {
            return Err(ProtocolError::InvalidPieceIndex { index, num_pieces }.into());
        }
        if self.peer_pieces.has_piece(index as usize) {
            return Ok(());
        }
        self.peer_pieces.set_piece(index as usize);

        if self.is_peer_seed() && self.torrent.is_seed() {
            return Err(ProtocolError::SeedToSeed.into());
        }

        let torrent = Arc::clone(&self.torrent);
        if !torrent.have_piece(index) && torrent.picker().is_wanted(index) {
            self.send_interested();
        }
        self.request_more();
        Ok(())
    }

    pub fn incoming_bitfield(&mut self, bits: &[u8]) -> Result<(), PeerError> {
        let num_pieces = self.torrent.num_pieces() as usize;
        let bitfield = Bitfield::from_bytes(bits, num_pieces).ok_or(
            ProtocolError::BitfieldSizeMismatch {
                expected: num_pieces.div_ceil(8),
                got: bits.len(),
            },
        )?;
        self.set_peer_pieces(bitfield)
    }

    pub fn incoming_have_all(&mut self) -> Result<(), PeerError> {
        if !self.supports_fast {
            return Err(ProtocolError::FastExtensionNotSupported("have_all").into());
        }
        self.set_peer_pieces(Bitfield::full(self.torrent.num_pieces() as usize))
    }

    pub fn incoming_have_none(&mut self) -> Result<(), PeerError> {
        if !self.supports_fast {
            return Err(ProtocolError::FastExtensionNotSupported("have_none").into());
        }
        self.set_peer_pieces(Bitfield::new(self.torrent.num_pieces() as usize))
    }

    fn set_peer_pieces(&mut self, bitfield: Bitfield) -> Result<(), PeerError> {
        self.peer_pieces = bitfield;
        self.bitfield_received = true;
        if self.is_peer_seed() && self.torrent.is_seed() {
            return Err(ProtocolError::SeedToSeed.into());
        }
        self.update_interest();
        self.request_more();
        Ok(())
    }

    pub fn incoming_request(&mut self, r: PeerRequest) -> Result<(), PeerError> {
        let valid = self.torrent.layout().is_valid_request(&r)
            && r.length <= BLOCK_SIZE
            && self.torrent.have_piece(r.piece);
        if !valid {
            self.invalid_requests += 1;
            debug!(peer = %self.label, request = %r, count = self.invalid_requests, "invalid request");
            self.torrent.post_alert(Alert::InvalidRequest {
                peer: self.label.clone(),
                request: r,
            });
            if self.supports_fast {
                self.send(Message::reject(r));
            }
            if self.invalid_requests > self.settings.max_invalid_requests {
                return Err(ProtocolError::TooManyInvalidRequests(self.invalid_requests).into());
            }
            return Ok(());
        }

        if self.choking.am_choking {
            debug!(peer = %self.label, request = %r, "request while choked");
            if self.supports_fast {
                self.send(Message::reject(r));
            }
            return Ok(());
        }

        if self.upload_queue_len() >= self.settings.max_allowed_in_request_queue {
            debug!(peer = %self.label, request = %r, "upload request queue full");
            if self.supports_fast {
                self.send(Message::reject(r));
            }
            return Ok(());
        }

        if self.upload_queue.contains(&r) || self.pending_reads.contains(&r) {
            return Ok(());
        }
        self.upload_queue.push_back(r);
        self.fill_send_buffer();
        Ok(())
    }

    /// A block arrived.
    ///
    /// It must answer one of our requests, or at least a block some other
    /// peer was asked for; anything else is unsolicited and fatal.
    pub fn incoming_piece(&mut self, r: PeerRequest, data: Bytes) -> Result<(), PeerError> {
        self.receiving = None;
        let torrent = Arc::clone(&self.torrent);
        let layout = torrent.layout();

        if data.len() != r.length as usize || !layout.is_valid_request(&r) {
            return Err(ProtocolError::InvalidPiece(r).into());
        }
        let block = match r.block(BLOCK_SIZE) {
            Some(b) if layout.block_size(r.piece, b.block_index, BLOCK_SIZE) == r.length => b,
            _ => return Err(ProtocolError::InvalidPiece(r).into()),
        };

        let picker = torrent.picker();
        let count_skips = self.kind == PeerKind::BitTorrent && !self.supports_fast;
        let arrival = self.pipeline.on_piece(
            block,
            self.settings.max_skipped_requests,
            count_skips,
            Instant::now(),
        );

        let Some(arrival) = arrival else {
            if picker.num_peers(block) == 0 && !picker.is_downloaded(block) {
                return Err(ProtocolError::UnsolicitedPiece(r).into());
            }
            debug!(peer = %self.label, request = %r, "redundant piece");
            self.stats.record_redundant(r.length as u64);
            return Ok(());
        };

        for dropped in arrival.dropped {
            debug!(peer = %self.label, block = %dropped.block, "request dropped by peer");
            picker.abort_download(dropped.block);
        }

        let entry = arrival.entry;
        if entry.not_wanted || torrent.have_piece(r.piece) || !picker.mark_as_writing(block) {
            debug!(peer = %self.label, request = %r, "discarding unwanted piece");
            self.stats.record_redundant(r.length as u64);
            self.request_more();
            return Ok(());
        }

        self.queued_disk_bytes += data.len();
        let router_torrent = Arc::clone(&torrent);
        let handle = self.handle;
        let peer = self.label.clone();
        torrent.disk().async_write(
            r,
            data,
            Box::new(move |result| {
                router_torrent.on_block_written(r, &result, &peer);
                router_torrent
                    .router()
                    .post(handle, ConnectionEvent::DiskWrite { request: r, result });
            }),
        );

        self.request_more();
        Ok(())
    }

    pub fn incoming_cancel(&mut self, r: PeerRequest) -> Result<(), PeerError> {
        let removed = if let Some(pos) = self.upload_queue.iter().position(|x| *x == r) {
            self.upload_queue.remove(pos);
            true
        } else if let Some(pos) = self.pending_reads.iter().position(|x| *x == r) {
            self.pending_reads.remove(pos);
            self.reading_bytes = self.reading_bytes.saturating_sub(r.length as usize);
            true
        } else {
            false
        };
        if removed && self.supports_fast {
            self.send(Message::reject(r));
        }
        Ok(())
    }

    pub fn incoming_reject(&mut self, r: PeerRequest) -> Result<(), PeerError> {
        if !self.supports_fast {
            return Err(ProtocolError::FastExtensionNotSupported("reject_request").into());
        }
        let Some(block) = r.block(BLOCK_SIZE) else {
            return Ok(());
        };
        match self.pipeline.on_reject(block) {
            Some(entry) => {
                debug!(peer = %self.label, request = %r, "request rejected");
                if entry.is_active() {
                    self.torrent.picker().abort_download(block);
                }
                self.request_more();
            }
            None => trace!(peer = %self.label, request = %r, "reject for unknown request"),
        }
        Ok(())
    }

    pub fn incoming_suggest(&mut self, piece: u32) -> Result<(), PeerError> {
        if !self.supports_fast {
            return Err(ProtocolError::FastExtensionNotSupported("suggest_piece").into());
        }
        if piece >= self.torrent.num_pieces()
            || self.torrent.have_piece(piece)
            || self.suggested.contains(&piece)
        {
            return Ok(());
        }
        if self.suggested.len() >= MAX_SUGGESTED_PIECES {
            self.suggested.pop_front();
        }
        self.suggested.push_back(piece);
        Ok(())
    }

    pub fn incoming_allowed_fast(&mut self, piece: u32) -> Result<(), PeerError> {
        if !self.supports_fast {
            return Err(ProtocolError::FastExtensionNotSupported("allowed_fast").into());
        }
        if piece >= self.torrent.num_pieces() || self.allowed_fast.contains(&piece) {
            return Ok(());
        }
        self.allowed_fast.push(piece);
        if self.choking.peer_choking && self.peer_pieces.has_piece(piece as usize) {
            self.request_more();
        }
        Ok(())
    }

    // ========================================================================
    // Request pipeline
    // ========================================================================

    fn block_request(&self, block: PieceBlock) -> PeerRequest {
        let length = self
            .torrent
            .layout()
            .block_size(block.piece_index, block.block_index, BLOCK_SIZE);
        PeerRequest::new(block.piece_index, block.offset(BLOCK_SIZE), length)
    }

    /// Queues a block for requesting.
    ///
    /// Returns `false` if the block is invalid, already queued, or the picker
    /// refuses it.
    pub fn add_request(&mut self, block: PieceBlock, busy: bool) -> bool {
        if self.is_disconnecting() {
            return false;
        }
        let layout = self.torrent.layout();
        if block.piece_index >= layout.num_pieces()
            || block.block_index >= layout.blocks_in_piece(block.piece_index, BLOCK_SIZE)
            || self.pipeline.contains(block)
        {
            return false;
        }
        if !self.torrent.picker().mark_as_downloading(block) {
            return false;
        }
        self.torrent.post_alert(Alert::BlockDownloading {
            peer: self.label.clone(),
            piece: block.piece_index,
            block: block.block_index,
        });
        let entry = if busy {
            PendingBlock::busy(block)
        } else {
            PendingBlock::new(block)
        };
        self.pipeline.push_request(entry);
        true
    }

    /// Withdraws a block.
    ///
    /// An unsent block is just dropped; a sent one costs a cancel message and
    /// is remembered so its late arrival is not unsolicited.
    pub fn cancel_request(&mut self, block: PieceBlock) {
        let outcome = self.pipeline.cancel(block);
        match outcome {
            CancelOutcome::NotFound => {}
            CancelOutcome::Unsent(entry) => {
                self.torrent.picker().abort_download(entry.block);
            }
            CancelOutcome::Sent(entry) => {
                if entry.is_active() {
                    self.torrent.picker().abort_download(entry.block);
                }
                let r = self.block_request(block);
                self.send(Message::cancel(r));
            }
        }
    }

    fn can_request(&self) -> bool {
        self.state == ConnectionState::Established
            && self.choking.am_interested
            && (!self.choking.peer_choking || !self.allowed_fast.is_empty())
            && !self.torrent.is_seed()
    }

    /// Tops up the request queue from the picker and sends what fits.
    pub fn request_more(&mut self) {
        if !self.can_request() {
            return;
        }
        let want = self
            .pipeline
            .queue_limit()
            .saturating_sub(self.pipeline.num_wanted());
        if want > 0 {
            let peer_has = if self.choking.peer_choking {
                let mut fast = Bitfield::new(self.peer_pieces.piece_count());
                for &p in &self.allowed_fast {
                    if self.peer_pieces.has_piece(p as usize) {
                        fast.set_piece(p as usize);
                    }
                }
                fast
            } else {
                self.peer_pieces.clone()
            };
            let ignore: Vec<PieceBlock> = self
                .pipeline
                .request_queue()
                .chain(self.pipeline.download_queue())
                .chain(self.pipeline.late_arrivals())
                .map(|b| b.block)
                .collect();
            let suggested: Vec<u32> = self.suggested.iter().copied().collect();
            let picks = self.torrent.picker().pick_blocks(
                &peer_has,
                want,
                self.prefer_whole_pieces,
                &suggested,
                &ignore,
            );

            for pick in picks {
                if pick.busy {
                    // at most one busy request, and only when nothing else is queued
                    if self.settings.strict_end_game
                        || self.pipeline.num_busy() > 0
                        || self.pipeline.num_wanted() > 0
                    {
                        continue;
                    }
                }
                self.add_request(pick.block, pick.busy);
            }
        }
        self.send_block_requests();
    }

    /// Moves queued blocks into flight while the pipeline has room.
    pub fn send_block_requests(&mut self) {
        if self.state != ConnectionState::Established {
            return;
        }
        let now = Instant::now();
        loop {
            if self.choking.peer_choking {
                let Some(front) = self.pipeline.request_queue().next() else {
                    break;
                };
                if !self.allowed_fast.contains(&front.block.piece_index) {
                    break;
                }
            }
            let Some(entry) = self.pipeline.pop_sendable(now) else {
                break;
            };
            let mut r = self.block_request(entry.block);
            if self.request_large_blocks {
                let mut last = entry.block;
                while let Some(next) = self.pipeline.pop_adjacent(last, now) {
                    r.length += self.block_request(next.block).length;
                    last = next.block;
                }
            }
            self.send(Message::request(r));
        }
    }

    /// Gives up on a peer that stopped answering.
    fn snub(&mut self, now: Instant) {
        let outcome = self.pipeline.snub(now);
        debug!(
            peer = %self.label,
            cancelled = outcome.cancelled.len(),
            timed_out = ?outcome.timed_out.map(|b| b.block),
            "peer snubbed"
        );
        self.torrent.post_alert(Alert::PeerSnubbed {
            peer: self.label.clone(),
        });

        let torrent = Arc::clone(&self.torrent);
        for entry in &outcome.cancelled {
            torrent.picker().abort_download(entry.block);
            let r = self.block_request(entry.block);
            self.send(Message::cancel(r));
        }
        if let Some(entry) = outcome.timed_out {
            torrent.picker().abort_download(entry.block);
        }
        for entry in &outcome.aborted {
            if entry.is_active() {
                torrent.picker().abort_download(entry.block);
            }
        }
        self.request_more();
    }

    // ========================================================================
    // Upload path
    // ========================================================================

    /// Issues disk reads for queued upload requests until the send buffer
    /// reaches its watermark.
    pub fn fill_send_buffer(&mut self) {
        while !self.choking.am_choking
            && self.state == ConnectionState::Established
            && self.outbox_bytes + self.reading_bytes < self.settings.send_buffer_watermark
        {
            let Some(r) = self.upload_queue.pop_front() else {
                break;
            };
            self.pending_reads.push(r);
            self.reading_bytes += r.length as usize;

            let torrent = Arc::clone(&self.torrent);
            let handle = self.handle;
            self.torrent.disk().async_read(
                r,
                Box::new(move |result| {
                    torrent
                        .router()
                        .post(handle, ConnectionEvent::DiskRead { request: r, result });
                }),
            );
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn handle_event(&mut self, event: ConnectionEvent) -> Result<(), PeerError> {
        if self.is_disconnecting() {
            return Ok(());
        }
        match event {
            ConnectionEvent::DiskWrite { request, result } => {
                self.on_disk_write_complete(request, result)
            }
            ConnectionEvent::DiskRead { request, result } => {
                self.on_disk_read_complete(request, result)
            }
            ConnectionEvent::WeHave(piece) => self.on_we_have(piece),
            ConnectionEvent::Choke => {
                self.send_choke();
                Ok(())
            }
            ConnectionEvent::Unchoke => {
                if self.kind == PeerKind::BitTorrent {
                    self.send_unchoke();
                    self.fill_send_buffer();
                }
                Ok(())
            }
            ConnectionEvent::Reconfigure(settings) => {
                self.reconfigure(settings);
                Ok(())
            }
            ConnectionEvent::Shutdown => Err(PeerError::ConnectionClosed),
        }
    }

    fn on_disk_write_complete(
        &mut self,
        request: PeerRequest,
        result: Result<(), DiskError>,
    ) -> Result<(), PeerError> {
        self.queued_disk_bytes = self.queued_disk_bytes.saturating_sub(request.length as usize);
        if let Err(e) = result {
            debug!(peer = %self.label, %request, error = %e, "block write failed");
        }
        Ok(())
    }

    fn on_disk_read_complete(
        &mut self,
        request: PeerRequest,
        result: Result<Bytes, DiskError>,
    ) -> Result<(), PeerError> {
        let Some(pos) = self.pending_reads.iter().position(|r| *r == request) else {
            trace!(peer = %self.label, %request, "read completed for cancelled request");
            return Ok(());
        };
        self.pending_reads.remove(pos);
        self.reading_bytes = self.reading_bytes.saturating_sub(request.length as usize);

        match result {
            Ok(data) if data.len() == request.length as usize => {
                self.send(Message::Piece {
                    index: request.piece,
                    begin: request.start,
                    data,
                });
            }
            Ok(_) => {
                warn!(peer = %self.label, %request, "short disk read");
                if self.supports_fast {
                    self.send(Message::reject(request));
                }
            }
            Err(e) => {
                warn!(peer = %self.label, %request, error = %e, "disk read failed");
                self.torrent.post_alert(Alert::FileError {
                    message: e.to_string(),
                });
                if self.supports_fast {
                    self.send(Message::reject(request));
                }
            }
        }
        self.fill_send_buffer();
        Ok(())
    }

    fn on_we_have(&mut self, piece: u32) -> Result<(), PeerError> {
        if self.kind == PeerKind::BitTorrent {
            self.send_have(piece);
        }
        if self.torrent.is_seed() && self.is_peer_seed() {
            return Err(ProtocolError::SeedToSeed.into());
        }
        self.update_interest();
        Ok(())
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Once-per-second housekeeping: rates, queue size, snubbing, keep-alive.
    pub fn second_tick(&mut self, now: Instant) -> Result<(), PeerError> {
        if self.state != ConnectionState::Established {
            return Ok(());
        }
        self.stats.tick(now);
        self.pipeline.update_desired(
            self.stats.download_payload_rate(),
            self.settings.request_queue_time,
            BLOCK_SIZE,
        );

        if self.pipeline.active_requests() > 0
            && now.saturating_duration_since(self.last_receive) >= self.settings.request_timeout
        {
            debug!(peer = %self.label, "no data received, timing out");
            return Err(PeerError::Timeout);
        }

        if self.pipeline.is_timed_out(now, self.settings.piece_timeout) {
            self.snub(now);
        }

        if self.kind == PeerKind::BitTorrent
            && now.saturating_duration_since(self.last_sent) >= KEEPALIVE_INTERVAL
            && self.outbox.is_empty()
        {
            self.send(Message::KeepAlive);
        }

        self.request_more();
        self.fill_send_buffer();
        Ok(())
    }
}
