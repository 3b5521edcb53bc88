//! Bandwidth limiting using token bucket algorithm.
//!
//! Connections never read or write without holding quota. Quota is requested
//! up front with [`BandwidthLimiter::request_quota`], which grants at most what
//! the bucket currently holds (possibly zero), and whatever was not used by the
//! actual transfer is handed back with [`BandwidthLimiter::refund_quota`].
//! A connection that is granted nothing simply waits for the bucket to refill,
//! which is the main backpressure mechanism of the engine.
//!
//! # Example
//!
//! ```
//! use seedwire::bandwidth::{BandwidthLimiter, Direction};
//!
//! // 1MB/s download, unlimited upload
//! let limiter = BandwidthLimiter::new(1_000_000, 0);
//!
//! let granted = limiter.request_quota(Direction::Download, 16384);
//! assert_eq!(granted, 16384);
//!
//! // only 10000 bytes arrived; give the rest back
//! limiter.use_quota(Direction::Download, 10000);
//! limiter.refund_quota(Direction::Download, granted - 10000);
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::constants::BANDWIDTH_BURST_MULTIPLIER;

/// Transfer direction a quota applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload = 0,
    Download = 1,
}

/// A token bucket rate limiter.
///
/// Tokens are added at a fixed rate and consumed by quota grants. The bucket
/// holds at most [`BANDWIDTH_BURST_MULTIPLIER`] seconds worth of tokens.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

struct TokenBucket {
    unlimited: bool,
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
    total_used: u64,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);
    }
}

impl RateLimiter {
    /// Creates a new rate limiter with the specified bytes per second limit.
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        let max_tokens = (bytes_per_sec * BANDWIDTH_BURST_MULTIPLIER) as f64;
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                unlimited: false,
                tokens: max_tokens,
                max_tokens,
                tokens_per_sec: bytes_per_sec as f64,
                last_update: Instant::now(),
                total_used: 0,
            }),
        })
    }

    /// Creates an unlimited rate limiter that grants every request in full.
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                unlimited: true,
                tokens: 0.0,
                max_tokens: 0.0,
                tokens_per_sec: 0.0,
                last_update: Instant::now(),
                total_used: 0,
            }),
        })
    }

    /// Updates the rate limit. A limit of 0 means unlimited.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        if bytes_per_sec == 0 {
            bucket.unlimited = true;
            return;
        }
        if bucket.unlimited {
            bucket.unlimited = false;
            bucket.tokens = (bytes_per_sec * BANDWIDTH_BURST_MULTIPLIER) as f64;
            bucket.last_update = Instant::now();
        }
        bucket.tokens_per_sec = bytes_per_sec as f64;
        bucket.max_tokens = (bytes_per_sec * BANDWIDTH_BURST_MULTIPLIER) as f64;
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);
    }

    /// Grants up to `amount` bytes, removing them from the bucket.
    ///
    /// Returns the number of bytes granted, which is zero when the bucket is
    /// empty. Never blocks.
    pub fn request(&self, amount: u64) -> u64 {
        self.request_at(amount, Instant::now())
    }

    pub(crate) fn request_at(&self, amount: u64, now: Instant) -> u64 {
        let mut bucket = self.bucket.lock();
        if bucket.unlimited {
            return amount;
        }
        bucket.refill(now);
        let granted = (bucket.tokens.max(0.0) as u64).min(amount);
        bucket.tokens -= granted as f64;
        granted
    }

    /// Returns unused bytes of an earlier grant to the bucket.
    pub fn refund(&self, amount: u64) {
        let mut bucket = self.bucket.lock();
        if bucket.unlimited {
            return;
        }
        bucket.tokens = (bucket.tokens + amount as f64).min(bucket.max_tokens);
    }

    /// Records bytes actually transferred under a grant.
    pub fn record_used(&self, amount: u64) {
        self.bucket.lock().total_used += amount;
    }

    /// Returns how long until `amount` bytes are available.
    pub fn wait_time(&self, amount: u64) -> Duration {
        let mut bucket = self.bucket.lock();
        if bucket.unlimited {
            return Duration::ZERO;
        }
        bucket.refill(Instant::now());
        let needed = amount as f64 - bucket.tokens;
        if needed <= 0.0 || bucket.tokens_per_sec <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(needed / bucket.tokens_per_sec)
        }
    }

    /// Returns the currently available tokens (bytes).
    pub fn available(&self) -> u64 {
        let bucket = self.bucket.lock();
        if bucket.unlimited {
            u64::MAX
        } else {
            bucket.tokens.max(0.0) as u64
        }
    }

    /// Total bytes reported through [`record_used`](Self::record_used).
    pub fn total_used(&self) -> u64 {
        self.bucket.lock().total_used
    }
}

/// A combined download and upload bandwidth limiter shared by the
/// connections of a torrent.
pub struct BandwidthLimiter {
    upload: Arc<RateLimiter>,
    download: Arc<RateLimiter>,
}

impl BandwidthLimiter {
    /// Creates a new bandwidth limiter with the specified limits.
    ///
    /// A limit of 0 means unlimited.
    pub fn new(download_limit: u64, upload_limit: u64) -> Self {
        let make = |limit: u64| {
            if limit == 0 {
                RateLimiter::unlimited()
            } else {
                RateLimiter::new(limit)
            }
        };
        Self {
            upload: make(upload_limit),
            download: make(download_limit),
        }
    }

    /// Creates an unlimited bandwidth limiter.
    pub fn unlimited() -> Self {
        Self {
            upload: RateLimiter::unlimited(),
            download: RateLimiter::unlimited(),
        }
    }

    fn channel(&self, direction: Direction) -> &RateLimiter {
        match direction {
            Direction::Upload => &self.upload,
            Direction::Download => &self.download,
        }
    }

    /// Asks for `amount` bytes of quota; returns what was granted.
    pub fn request_quota(&self, direction: Direction, amount: u64) -> u64 {
        self.channel(direction).request(amount)
    }

    /// Records `amount` bytes as actually transferred.
    pub fn use_quota(&self, direction: Direction, amount: u64) {
        self.channel(direction).record_used(amount)
    }

    /// Hands back quota that was granted but not used.
    pub fn refund_quota(&self, direction: Direction, amount: u64) {
        if amount > 0 {
            self.channel(direction).refund(amount)
        }
    }

    /// How long a connection should wait before asking again.
    pub fn wait_time(&self, direction: Direction, amount: u64) -> Duration {
        self.channel(direction).wait_time(amount)
    }

    /// Waits until some quota is granted and returns it.
    pub async fn acquire(&self, direction: Direction, amount: u64) -> u64 {
        loop {
            let granted = self.request_quota(direction, amount);
            if granted > 0 || amount == 0 {
                return granted;
            }
            let wait = self
                .wait_time(direction, amount.min(16384))
                .max(Duration::from_millis(10));
            tokio::time::sleep(wait).await;
        }
    }

    /// Sets the download rate limit. A limit of 0 means unlimited.
    pub fn set_download_limit(&self, bytes_per_sec: u64) {
        self.download.set_rate(bytes_per_sec);
    }

    /// Sets the upload rate limit. A limit of 0 means unlimited.
    pub fn set_upload_limit(&self, bytes_per_sec: u64) {
        self.upload.set_rate(bytes_per_sec);
    }

    /// Returns the download rate limiter.
    pub fn download_limiter(&self) -> Arc<RateLimiter> {
        self.download.clone()
    }

    /// Returns the upload rate limiter.
    pub fn upload_limiter(&self) -> Arc<RateLimiter> {
        self.upload.clone()
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
