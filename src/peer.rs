//! Peer wire protocol (BEP-3, BEP-6)
//!
//! [`PeerConnection`] is the transport-independent state machine: choking,
//! interest, have/bitfield tracking, the request pipeline, the upload queue
//! and the teardown sequence. Transports wrap it through [`PeerWire`]:
//! [`BtPeerConnection`] speaks the length-prefixed wire protocol, and
//! [`crate::webseed::WebPeerConnection`] speaks HTTP range requests.
//!
//! Completions from the disk and notifications from the torrent reach a
//! connection through the [`EventRouter`] by [`ConnectionHandle`]. A handle
//! outlives its connection only as a stale key; events posted to it are
//! dropped.

mod bitfield;
mod bt;
mod choking;
mod connection;
mod error;
mod message;
mod peer_id;
mod piece;
mod pipeline;
mod reassembler;
mod receive_buffer;
mod stats;
mod table;
mod transport;

pub use bitfield::Bitfield;
pub use bt::{handshake, BtPeerConnection};
pub use choking::ChokingState;
pub use connection::{ConnectionState, PeerConnection, PeerKind};
pub use error::{ErrorKind, PeerError, ProtocolError};
pub use message::{Handshake, Message, MessageId, PIECE_HEADER_LEN};
pub use peer_id::PeerId;
pub use piece::{
    compute_block_count, compute_block_length, PeerRequest, PendingBlock, PieceBlock,
    PieceBlockProgress,
};
pub use pipeline::{Arrival, CancelOutcome, RequestPipeline, SnubOutcome};
pub use reassembler::PieceReassembler;
pub use receive_buffer::ReceiveBuffer;
pub use stats::{ByteRate, TransferStats};
pub use table::{ConnectionEvent, ConnectionHandle, ConnectionTable, EventRouter};
pub use transport::{accept_peer, connect_peer, run, run_bt_peer, PeerWire};
