//! seedwire - BitTorrent peer connections and web seeds
//!
//! The per-connection half of a BitTorrent client: the peer-wire state
//! machine, request pipelining, block reassembly and web seeding over HTTP.
//! Piece picking, disk I/O and alert delivery are collaborators supplied by
//! the embedding session through the traits in [`torrent`] and [`alert`].
//!
//! # Modules
//!
//! - [`peer`] - BEP-3/6 peer wire protocol, request pipeline, connection driver
//! - [`webseed`] - BEP-19 web seeds: HTTP range requests, seed registry
//! - [`http`] - Incremental HTTP/1.1 response parser with chunked encoding
//! - [`torrent`] - Per-torrent context: file layout, picker, disk interfaces
//! - [`bandwidth`] - Token-bucket rate limiting and quota handout
//! - [`alert`] - Notifications posted by connections
//! - [`settings`] - Connection configuration snapshot
//! - [`constants`] - Protocol constants and tuning defaults

pub mod alert;
pub mod bandwidth;
pub mod constants;
pub mod http;
pub mod peer;
pub mod settings;
pub mod torrent;
pub mod webseed;

pub use alert::{Alert, AlertQueue, AlertSink};
pub use bandwidth::{BandwidthLimiter, Direction, RateLimiter};
pub use http::{HttpError, HttpParser};
pub use peer::{
    connect_peer, BtPeerConnection, ConnectionEvent, ConnectionHandle, ErrorKind, Message,
    PeerConnection, PeerError, PeerId, PeerRequest, PeerWire, ProtocolError, RequestPipeline,
};
pub use settings::PeerSettings;
pub use torrent::{DiskError, DiskIo, FileLayout, MemoryDisk, PiecePicker, SimplePicker, Torrent};
pub use webseed::{connect_web_seed, WebPeerConnection, WebSeedError, WebSeedList};
