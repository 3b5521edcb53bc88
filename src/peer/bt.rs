use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use super::connection::PeerConnection;
use super::error::{PeerError, ProtocolError};
use super::message::{Handshake, Message, MessageId, PIECE_HEADER_LEN};
use super::peer_id::PeerId;
use super::piece::PeerRequest;
use super::reassembler::PieceReassembler;
use super::receive_buffer::ReceiveBuffer;
use super::transport::PeerWire;
use crate::bandwidth::Direction;
use crate::constants::{BLOCK_SIZE, HANDSHAKE_LEN, HANDSHAKE_TIMEOUT};

/// A BitTorrent peer: length-prefixed framing around a [`PeerConnection`].
///
/// `piece` bodies are collected in a [`PieceReassembler`] as they arrive, so
/// block progress is visible before the whole message is in.
pub struct BtPeerConnection {
    core: PeerConnection,
    piece: PieceReassembler,
}

impl BtPeerConnection {
    pub fn new(core: PeerConnection) -> Self {
        Self {
            core,
            piece: PieceReassembler::new(),
        }
    }

    fn receive_piece_body(&mut self, buf: &mut ReceiveBuffer) -> Result<bool, PeerError> {
        let n = self.piece.remaining().min(buf.len());
        if n == 0 {
            return Ok(false);
        }
        let chunk = buf.consume(n);
        self.piece.fill(&chunk);
        self.core
            .stats_mut()
            .record(Direction::Download, n as u64, 0);
        self.core.set_receiving(self.piece.progress(BLOCK_SIZE));

        if let Some((r, data)) = self.piece.take() {
            trace!(peer = %self.core.label(), request = %r, "piece received");
            self.core.incoming_piece(r, data)?;
        }
        Ok(true)
    }

    /// Starts collecting a `piece` body once its 13-byte header is buffered.
    fn start_piece(&mut self, buf: &mut ReceiveBuffer, frame: usize) -> Result<bool, PeerError> {
        let Some(header) = buf.peek(PIECE_HEADER_LEN) else {
            return Ok(false);
        };
        let index = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
        let begin = u32::from_be_bytes([header[9], header[10], header[11], header[12]]);
        let length = (frame - PIECE_HEADER_LEN) as u32;
        buf.advance(PIECE_HEADER_LEN);
        self.core
            .stats_mut()
            .record(Direction::Download, 0, PIECE_HEADER_LEN as u64);

        // nothing is buffered for a block we could never have asked for
        let r = PeerRequest::new(index, begin, length);
        if length > BLOCK_SIZE || !self.core.torrent().layout().is_valid_request(&r) {
            return Err(ProtocolError::InvalidPiece(r).into());
        }
        self.piece.start(r);
        self.core.set_receiving(self.piece.progress(BLOCK_SIZE));
        Ok(true)
    }
}

impl PeerWire for BtPeerConnection {
    fn connection(&self) -> &PeerConnection {
        &self.core
    }

    fn connection_mut(&mut self) -> &mut PeerConnection {
        &mut self.core
    }

    fn on_receive(&mut self, buf: &mut ReceiveBuffer) -> Result<(), PeerError> {
        self.core.mark_received(Instant::now());
        loop {
            if self.core.is_disconnecting() {
                return Ok(());
            }
            if self.piece.is_active() {
                if !self.receive_piece_body(buf)? {
                    return Ok(());
                }
                continue;
            }

            let Some(frame) = Message::frame_len(buf.as_slice())? else {
                return Ok(());
            };
            let is_piece = buf.as_slice().get(4) == Some(&(MessageId::Piece as u8));
            if is_piece && frame >= PIECE_HEADER_LEN {
                if !self.start_piece(buf, frame)? {
                    return Ok(());
                }
                continue;
            }

            if buf.len() < frame {
                buf.set_packet_size(frame);
                return Ok(());
            }
            let data = buf.consume(frame);
            self.core
                .stats_mut()
                .record(Direction::Download, 0, frame as u64);
            let message = Message::decode(data)?;
            self.core.incoming_message(message)?;
        }
    }

    fn fill_send_buffer(&mut self, out: &mut BytesMut) -> Result<(), PeerError> {
        self.core.fill_send_buffer();
        while let Some(message) = self.core.pop_outgoing() {
            let payload = message.payload_len() as u64;
            let total = message.wire_len() as u64;
            message.encode_into(out);
            self.core
                .stats_mut()
                .record(Direction::Upload, payload, total - payload);
        }
        Ok(())
    }

    fn disconnect(&mut self, error: &PeerError) {
        self.piece.clear();
        self.core.disconnect(error);
    }
}

/// Exchanges handshakes on a fresh stream.
///
/// The initiator speaks first; the accepting side answers only after the
/// remote handshake checked out. Fails unless the remote side names
/// `info_hash`.
pub async fn handshake<S>(
    stream: &mut S,
    info_hash: [u8; 20],
    our_id: PeerId,
    initiator: bool,
) -> Result<Handshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::new(info_hash, *our_id.as_bytes());
    let exchange = async {
        if initiator {
            stream.write_all(&ours.encode()).await?;
        }
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;
        let theirs = Handshake::decode(&buf)?;
        if theirs.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        if !initiator {
            stream.write_all(&ours.encode()).await?;
        }
        Ok(theirs)
    };
    let theirs = timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| PeerError::Timeout)??;
    debug!(
        peer_id = ?PeerId(theirs.peer_id),
        fast = theirs.supports_fast_extension(),
        "handshake received"
    );
    Ok(theirs)
}
