//! Per-peer block request bookkeeping.
//!
//! Blocks picked for a peer first wait in the *request queue*. When there is
//! room in the pipeline they are sent and move to the *download queue*,
//! where they stay until the piece arrives, the request is rejected or
//! cancelled, or the connection goes away.
//!
//! The download queue holds only active requests, so its length is what the
//! queue limit bounds. Requests given back to the picker after a timeout,
//! or cancelled, move to a short list of late arrivals so a piece that
//! still shows up is recognised as ours.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::piece::{PendingBlock, PieceBlock};
use crate::constants::MAX_NOT_WANTED_REQUESTS;
use crate::settings::PeerSettings;

/// Result of cancelling a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The block is not queued, or was already cancelled.
    NotFound,
    /// The block had not been sent yet and was simply dropped.
    Unsent(PendingBlock),
    /// The block was in flight. It is kept as a not-wanted late arrival.
    Sent(PendingBlock),
}

/// What a snub did to the queues.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnubOutcome {
    /// In-flight blocks now flagged not-wanted; a cancel should be sent.
    pub cancelled: Vec<PendingBlock>,
    /// The newest in-flight block, now flagged timed out.
    pub timed_out: Option<PendingBlock>,
    /// Unsent blocks removed from the request queue.
    pub aborted: Vec<PendingBlock>,
}

/// A piece matched against the download queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    /// The entry the piece answered.
    pub entry: PendingBlock,
    /// Earlier requests overtaken too often, assumed dropped by the peer.
    pub dropped: Vec<PendingBlock>,
}

#[derive(Debug)]
pub struct RequestPipeline {
    request_queue: VecDeque<PendingBlock>,
    download_queue: VecDeque<PendingBlock>,
    late: VecDeque<PendingBlock>,
    desired_queue_size: usize,
    min_queue: usize,
    max_queue: usize,
    snubbed: bool,
    last_piece: Instant,
    last_request: Instant,
}

impl RequestPipeline {
    pub fn new(settings: &PeerSettings) -> Self {
        let now = Instant::now();
        let min_queue = settings.min_request_queue.max(1);
        let max_queue = settings.max_out_request_queue.max(min_queue);
        Self {
            request_queue: VecDeque::new(),
            download_queue: VecDeque::new(),
            late: VecDeque::new(),
            desired_queue_size: min_queue,
            min_queue,
            max_queue,
            snubbed: false,
            last_piece: now,
            last_request: now,
        }
    }

    /// Applies new queue bounds.
    pub fn reconfigure(&mut self, settings: &PeerSettings) {
        self.min_queue = settings.min_request_queue.max(1);
        self.max_queue = settings.max_out_request_queue.max(self.min_queue);
        self.desired_queue_size = self
            .desired_queue_size
            .clamp(self.min_queue, self.max_queue);
    }

    /// Recomputes the desired queue size from the measured download rate.
    ///
    /// The result always lies in `[min_queue, max_queue]`.
    pub fn update_desired(&mut self, download_rate: f64, queue_time: Duration, block_size: u32) {
        let blocks = queue_time.as_secs_f64() * download_rate / block_size.max(1) as f64;
        let blocks = if blocks.is_finite() && blocks > 0.0 {
            blocks as usize
        } else {
            0
        };
        self.desired_queue_size = blocks.clamp(self.min_queue, self.max_queue);
    }

    pub fn desired_queue_size(&self) -> usize {
        self.desired_queue_size
    }

    /// Number of active requests the pipeline may have in flight.
    pub fn queue_limit(&self) -> usize {
        if self.snubbed {
            1
        } else {
            self.desired_queue_size
        }
    }

    pub fn min_queue(&self) -> usize {
        self.min_queue
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    pub fn is_snubbed(&self) -> bool {
        self.snubbed
    }

    /// In-flight requests that count against the queue limit.
    pub fn active_requests(&self) -> usize {
        self.download_queue.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_requests() < self.queue_limit()
    }

    pub fn request_queue(&self) -> impl Iterator<Item = &PendingBlock> {
        self.request_queue.iter()
    }

    pub fn download_queue(&self) -> impl Iterator<Item = &PendingBlock> {
        self.download_queue.iter()
    }

    /// Cancelled or timed-out requests the peer may still answer.
    pub fn late_arrivals(&self) -> impl Iterator<Item = &PendingBlock> {
        self.late.iter()
    }

    pub fn request_queue_len(&self) -> usize {
        self.request_queue.len()
    }

    pub fn download_queue_len(&self) -> usize {
        self.download_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request_queue.is_empty() && self.download_queue.is_empty() && self.late.is_empty()
    }

    /// Whether the block is queued, in flight or expected late.
    pub fn contains(&self, block: PieceBlock) -> bool {
        self.request_queue
            .iter()
            .chain(self.download_queue.iter())
            .chain(self.late.iter())
            .any(|b| b.block == block)
    }

    /// Active requests tagged as also requested from another peer.
    pub fn num_busy(&self) -> usize {
        self.request_queue
            .iter()
            .chain(self.download_queue.iter())
            .filter(|b| b.busy)
            .count()
    }

    /// Entries across both queues.
    pub fn num_wanted(&self) -> usize {
        self.request_queue.len() + self.download_queue.len()
    }

    pub fn push_request(&mut self, entry: PendingBlock) {
        self.request_queue.push_back(entry);
    }

    /// Moves the next unsent block to the download queue if there is room.
    pub fn pop_sendable(&mut self, now: Instant) -> Option<PendingBlock> {
        if !self.has_capacity() {
            return None;
        }
        let entry = self.request_queue.pop_front()?;
        self.mark_sent(entry, now);
        Some(entry)
    }

    /// Like [`pop_sendable`](Self::pop_sendable), but only if the next block
    /// directly follows `prev` in the same piece.
    pub fn pop_adjacent(&mut self, prev: PieceBlock, now: Instant) -> Option<PendingBlock> {
        if !self.has_capacity() {
            return None;
        }
        let front = self.request_queue.front()?;
        if front.block.piece_index != prev.piece_index
            || front.block.block_index != prev.block_index + 1
        {
            return None;
        }
        let entry = self.request_queue.pop_front()?;
        self.mark_sent(entry, now);
        Some(entry)
    }

    fn mark_sent(&mut self, entry: PendingBlock, now: Instant) {
        if self.download_queue.is_empty() {
            self.last_request = now;
        }
        self.download_queue.push_back(entry);
    }

    /// Matches an arriving block against the download queue, then against
    /// the late arrivals.
    ///
    /// Requests sent before the matched one have been overtaken. Each is
    /// counted, and when `count_skips` is set those overtaken more than
    /// `max_skipped` times are removed and reported as dropped.
    pub fn on_piece(
        &mut self,
        block: PieceBlock,
        max_skipped: u32,
        count_skips: bool,
        now: Instant,
    ) -> Option<Arrival> {
        let mut dropped = Vec::new();
        let entry = match self.download_queue.iter().position(|b| b.block == block) {
            Some(index) => {
                let entry = self.download_queue.remove(index)?;
                if count_skips {
                    let mut i = 0;
                    for _ in 0..index {
                        let b = &mut self.download_queue[i];
                        b.skipped += 1;
                        if b.skipped > max_skipped {
                            if let Some(b) = self.download_queue.remove(i) {
                                dropped.push(b);
                            }
                            continue;
                        }
                        i += 1;
                    }
                }
                entry
            }
            None => {
                let index = self.late.iter().position(|b| b.block == block)?;
                self.late.remove(index)?
            }
        };

        self.last_piece = now;
        self.snubbed = false;
        Some(Arrival { entry, dropped })
    }

    /// Removes a rejected request.
    pub fn on_reject(&mut self, block: PieceBlock) -> Option<PendingBlock> {
        if let Some(index) = self.download_queue.iter().position(|b| b.block == block) {
            return self.download_queue.remove(index);
        }
        let index = self.late.iter().position(|b| b.block == block)?;
        self.late.remove(index)
    }

    pub fn cancel(&mut self, block: PieceBlock) -> CancelOutcome {
        if let Some(index) = self.request_queue.iter().position(|b| b.block == block) {
            return match self.request_queue.remove(index) {
                Some(entry) => CancelOutcome::Unsent(entry),
                None => CancelOutcome::NotFound,
            };
        }

        if let Some(index) = self.download_queue.iter().position(|b| b.block == block) {
            return match self.download_queue.remove(index) {
                Some(entry) => {
                    self.push_late(PendingBlock {
                        not_wanted: true,
                        ..entry
                    });
                    CancelOutcome::Sent(entry)
                }
                None => CancelOutcome::NotFound,
            };
        }

        // a timed-out request can still be cancelled once
        match self.late.iter_mut().find(|b| b.block == block) {
            Some(entry) if !entry.not_wanted => {
                let before = *entry;
                entry.not_wanted = true;
                CancelOutcome::Sent(before)
            }
            _ => CancelOutcome::NotFound,
        }
    }

    fn push_late(&mut self, entry: PendingBlock) {
        self.late.push_back(entry);
        while self.late.len() > MAX_NOT_WANTED_REQUESTS {
            self.late.pop_front();
        }
    }

    /// Whether requests have been outstanding for longer than `timeout`
    /// without any piece arriving.
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        if self.active_requests() == 0 {
            return false;
        }
        let since = self.last_piece.max(self.last_request);
        now.saturating_duration_since(since) >= timeout
    }

    /// Collapses the pipeline after a timeout.
    ///
    /// The newest in-flight request is flagged timed out, older in-flight
    /// requests are cancelled and unsent ones dropped, leaving room for
    /// exactly one fresh request.
    pub fn snub(&mut self, now: Instant) -> SnubOutcome {
        self.snubbed = true;
        self.last_request = now;

        let mut outcome = SnubOutcome::default();
        let mut in_flight: Vec<PendingBlock> = self.download_queue.drain(..).collect();
        let newest = in_flight.pop();
        for entry in in_flight {
            outcome.cancelled.push(entry);
            self.push_late(PendingBlock {
                not_wanted: true,
                ..entry
            });
        }
        if let Some(entry) = newest {
            outcome.timed_out = Some(entry);
            self.push_late(PendingBlock {
                timed_out: true,
                ..entry
            });
        }
        outcome.aborted = self.request_queue.drain(..).collect();
        outcome
    }

    /// Empties every queue, in-flight entries first.
    pub fn clear(&mut self) -> Vec<PendingBlock> {
        self.download_queue
            .drain(..)
            .chain(self.late.drain(..))
            .chain(self.request_queue.drain(..))
            .collect()
    }

    /// Empties the queues except for in-flight entries matching `keep`.
    pub fn clear_except(&mut self, keep: impl Fn(&PendingBlock) -> bool) -> Vec<PendingBlock> {
        let mut removed = Vec::new();
        let mut split = |b: &PendingBlock| {
            if keep(b) {
                true
            } else {
                removed.push(*b);
                false
            }
        };
        self.download_queue.retain(&mut split);
        self.late.retain(&mut split);
        removed.extend(self.request_queue.drain(..));
        removed
    }

    /// Restarts the timeout clock, e.g. after an unchoke.
    pub fn reset_timers(&mut self, now: Instant) {
        self.last_piece = now;
        self.last_request = now;
    }

    pub fn last_piece(&self) -> Instant {
        self.last_piece
    }
}
