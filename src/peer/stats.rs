use std::time::Duration;

use tokio::time::Instant;

use crate::bandwidth::Direction;

/// Exponentially smoothed byte rate.
#[derive(Debug, Clone)]
pub struct ByteRate {
    last_update: Instant,
    avg: f64,
    smoothing: f64,
    bytes: u64,
}

impl ByteRate {
    pub fn new(window: Duration, update_interval: Duration, now: Instant) -> Self {
        let n = window.as_secs_f64() / update_interval.as_secs_f64().max(f64::EPSILON);
        Self {
            last_update: now,
            avg: 0.0,
            smoothing: 2.0 / (n + 1.0),
            bytes: 0,
        }
    }

    pub fn add(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    /// Folds the bytes since the last update into the average.
    pub fn update(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update);
        if elapsed.is_zero() {
            return;
        }
        let instant = self.bytes as f64 / elapsed.as_secs_f64();
        if self.avg == 0.0 {
            self.avg = instant;
        } else {
            self.avg = self.smoothing * instant + (1.0 - self.smoothing) * self.avg;
        }
        self.bytes = 0;
        self.last_update = now;
    }

    /// Bytes per second.
    pub fn rate(&self) -> f64 {
        self.avg
    }
}

#[derive(Debug, Clone)]
struct Channel {
    payload: u64,
    protocol: u64,
    payload_rate: ByteRate,
}

/// Byte counters and rates of one connection.
///
/// Payload is piece data; protocol is everything else on the wire (message
/// framing, HTTP headers, chunk headers).
#[derive(Debug, Clone)]
pub struct TransferStats {
    upload: Channel,
    download: Channel,
    redundant: u64,
}

impl TransferStats {
    pub fn new(window: Duration, tick: Duration) -> Self {
        let now = Instant::now();
        let channel = || Channel {
            payload: 0,
            protocol: 0,
            payload_rate: ByteRate::new(window, tick, now),
        };
        Self {
            upload: channel(),
            download: channel(),
            redundant: 0,
        }
    }

    fn channel(&mut self, direction: Direction) -> &mut Channel {
        match direction {
            Direction::Upload => &mut self.upload,
            Direction::Download => &mut self.download,
        }
    }

    pub fn record(&mut self, direction: Direction, payload: u64, protocol: u64) {
        let channel = self.channel(direction);
        channel.payload += payload;
        channel.protocol += protocol;
        channel.payload_rate.add(payload);
    }

    /// Piece data that was received but not needed.
    pub fn record_redundant(&mut self, bytes: u64) {
        self.redundant += bytes;
    }

    pub fn tick(&mut self, now: Instant) {
        self.upload.payload_rate.update(now);
        self.download.payload_rate.update(now);
    }

    pub fn total_payload_download(&self) -> u64 {
        self.download.payload
    }

    pub fn total_protocol_download(&self) -> u64 {
        self.download.protocol
    }

    pub fn total_payload_upload(&self) -> u64 {
        self.upload.payload
    }

    pub fn total_protocol_upload(&self) -> u64 {
        self.upload.protocol
    }

    pub fn total_redundant(&self) -> u64 {
        self.redundant
    }

    pub fn download_payload_rate(&self) -> f64 {
        self.download.payload_rate.rate()
    }

    pub fn upload_payload_rate(&self) -> f64 {
        self.upload.payload_rate.rate()
    }
}
