//! Connection configuration snapshot.
//!
//! A [`PeerSettings`] value is handed to every connection when it is created
//! and shared behind an [`Arc`]. Connections never consult global state; a
//! settings change is delivered explicitly through `reconfigure`.

use std::sync::Arc;
use std::time::Duration;

use crate::constants::*;

/// Tuning knobs consulted by peer and web seed connections.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSettings {
    /// Seconds of download the outstanding request queue should cover.
    pub request_queue_time: Duration,
    /// Minimum desired number of outstanding requests.
    pub min_request_queue: usize,
    /// Maximum desired number of outstanding requests.
    pub max_out_request_queue: usize,
    /// Snub a peer after this long without a piece while requests are outstanding.
    pub piece_timeout: Duration,
    /// Give up on a single request after this long.
    pub request_timeout: Duration,
    /// Cap on requests a remote peer may queue with us.
    pub max_allowed_in_request_queue: usize,
    /// Invalid requests tolerated before disconnecting the peer.
    pub max_invalid_requests: u32,
    /// Overtakes tolerated before a request is considered dropped.
    pub max_skipped_requests: u32,
    /// Stop issuing disk reads once this many bytes wait in the send buffer.
    pub send_buffer_watermark: usize,
    /// Stop reading from the socket while this many bytes wait for the disk.
    pub max_queued_disk_bytes: usize,
    /// Largest single socket read.
    pub receive_buffer_size: usize,
    /// Web seed cooldown when the server gives no `Retry-After`.
    pub web_seed_retry_default: Duration,
    /// Sent as `User-Agent` to web seeds.
    pub user_agent: String,
    /// Count web seed payload in the transfer statistics.
    pub report_web_seed_downloads: bool,
    /// Never request a block that is already requested from another peer.
    pub strict_end_game: bool,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            request_queue_time: REQUEST_QUEUE_TIME,
            min_request_queue: MIN_REQUEST_QUEUE,
            max_out_request_queue: MAX_OUT_REQUEST_QUEUE,
            piece_timeout: PIECE_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            max_allowed_in_request_queue: MAX_ALLOWED_IN_REQUEST_QUEUE,
            max_invalid_requests: MAX_INVALID_REQUESTS,
            max_skipped_requests: MAX_SKIPPED_REQUESTS,
            send_buffer_watermark: SEND_BUFFER_WATERMARK,
            max_queued_disk_bytes: MAX_QUEUED_DISK_BYTES,
            receive_buffer_size: RECEIVE_BUFFER_SIZE,
            web_seed_retry_default: WEB_SEED_RETRY_DEFAULT,
            user_agent: USER_AGENT.to_string(),
            report_web_seed_downloads: true,
            strict_end_game: false,
        }
    }
}

impl PeerSettings {
    /// Wraps the settings for sharing between connections.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}
