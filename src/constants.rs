//! Protocol constants and tuning parameters.
//!
//! Defaults mirror what mainstream clients ship with. Everything a connection
//! consults at runtime is copied into [`PeerSettings`](crate::PeerSettings),
//! so changing a value here only changes the default snapshot.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8] = b"-SW0001-";

/// User agent string for HTTP requests
pub const USER_AGENT: &str = "seedwire/0.1.0";

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Web seeds prefer to download at least this many bytes per request
pub const WEB_SEED_PREFERRED_REQUEST: u32 = 1024 * 1024;

/// Extra room kept in the receive buffer for HTTP framing around one block
pub const REQUEST_SIZE_OVERHEAD: usize = 5000;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Request pipelining
// ============================================================================

/// Seconds worth of download the request queue should cover
pub const REQUEST_QUEUE_TIME: Duration = Duration::from_secs(3);

/// Lower bound on the number of outstanding requests
pub const MIN_REQUEST_QUEUE: usize = 2;

/// Maximum outstanding block requests per peer (libtorrent default: 500)
pub const MAX_OUT_REQUEST_QUEUE: usize = 500;

/// Upper bound on requests a remote peer may queue with us
pub const MAX_ALLOWED_IN_REQUEST_QUEUE: usize = 250;

/// Invalid requests tolerated from one peer before it is disconnected
pub const MAX_INVALID_REQUESTS: u32 = 300;

/// Times a request may be overtaken by later ones before it is given up on
pub const MAX_SKIPPED_REQUESTS: u32 = 3;

/// Cancelled requests remembered so their late pieces are not unsolicited
pub const MAX_NOT_WANTED_REQUESTS: usize = 64;

/// Size of the suggested-piece set kept per peer (BEP-6)
pub const MAX_SUGGESTED_PIECES: usize = 10;

// ============================================================================
// Timeouts
// ============================================================================

/// Time without a piece, while requests are outstanding, before a peer is snubbed
pub const PIECE_TIMEOUT: Duration = Duration::from_secs(20);

/// Block request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// TCP connect timeout for peers and web seeds
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handshake timeout after TCP connect
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive message interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Interval of the per-connection housekeeping tick
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Smoothing window for transfer rate measurements
pub const RATE_CALC_WINDOW: Duration = Duration::from_secs(5);

/// Web seed cooldown when a server refuses without `Retry-After`
pub const WEB_SEED_RETRY_DEFAULT: Duration = Duration::from_secs(5 * 60);

// ============================================================================
// Buffer sizes
// ============================================================================

/// Read buffer size for peer connections
pub const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Send buffer fill level above which no more disk reads are issued
pub const SEND_BUFFER_WATERMARK: usize = 128 * 1024;

/// Outstanding disk write bytes above which the connection stops reading
pub const MAX_QUEUED_DISK_BYTES: usize = 1024 * 1024;

/// Longest status, header or chunk-header line the HTTP parser accepts
pub const MAX_HTTP_LINE: usize = 8192;

// ============================================================================
// Protocol constants
// ============================================================================

/// BitTorrent protocol string
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Handshake length in bytes
pub const HANDSHAKE_LEN: usize = 68;

/// Extension protocol bit (BEP-10), reserved byte 5
pub const EXTENSION_BIT: u8 = 0x10;

/// DHT support bit (BEP-5), reserved byte 7
pub const DHT_BIT: u8 = 0x01;

/// Fast extension bit (BEP-6), reserved byte 7
pub const FAST_EXTENSION_BIT: u8 = 0x04;

// ============================================================================
// Bandwidth constants
// ============================================================================

/// Bandwidth burst multiplier
pub const BANDWIDTH_BURST_MULTIPLIER: u64 = 2;
