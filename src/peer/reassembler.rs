use bytes::{Bytes, BytesMut};

use super::piece::{PeerRequest, PieceBlockProgress};

/// Collects the bytes of one block that arrive in several pieces.
///
/// The buffer never grows past the length of the block it was started
/// for. Once full, [`take`](Self::take) hands the block out and the
/// reassembler is idle again.
#[derive(Debug, Default)]
pub struct PieceReassembler {
    request: Option<PeerRequest>,
    buf: BytesMut,
}

impl PieceReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts collecting `request`, discarding anything held before.
    pub fn start(&mut self, request: PeerRequest) {
        self.request = Some(request);
        self.buf.clear();
        self.buf.reserve(request.length as usize);
    }

    /// Starts collecting `request` with `partial` already received.
    ///
    /// Returns `false` and stays idle if `partial` does not fit.
    pub fn resume(&mut self, request: PeerRequest, partial: &[u8]) -> bool {
        if partial.len() > request.length as usize {
            return false;
        }
        self.start(request);
        self.buf.extend_from_slice(partial);
        true
    }

    pub fn is_active(&self) -> bool {
        self.request.is_some()
    }

    pub fn request(&self) -> Option<PeerRequest> {
        self.request
    }

    /// Bytes received for the current block.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        match self.request {
            Some(r) => r.length as usize - self.buf.len(),
            None => 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.request, Some(r) if self.buf.len() == r.length as usize)
    }

    /// Appends as much of `data` as the block still needs.
    ///
    /// Returns the number of bytes taken.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = self.remaining().min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        n
    }

    /// Appends up to `count` zero bytes; returns how many were added.
    pub fn fill_zeros(&mut self, count: usize) -> usize {
        let n = self.remaining().min(count);
        self.buf.resize(self.buf.len() + n, 0);
        n
    }

    /// Hands out the block once it is complete.
    pub fn take(&mut self) -> Option<(PeerRequest, Bytes)> {
        if !self.is_complete() {
            return None;
        }
        let request = self.request.take()?;
        Some((request, self.buf.split().freeze()))
    }

    /// Hands out whatever was collected, complete or not.
    pub fn take_partial(&mut self) -> Option<(PeerRequest, Bytes)> {
        let request = self.request.take()?;
        Some((request, self.buf.split().freeze()))
    }

    pub fn clear(&mut self) {
        self.request = None;
        self.buf = BytesMut::new();
    }

    pub fn progress(&self, block_size: u32) -> Option<PieceBlockProgress> {
        let r = self.request?;
        Some(PieceBlockProgress {
            piece_index: r.piece,
            block_index: r.start / block_size,
            bytes_downloaded: self.buf.len() as u32,
            full_block_bytes: r.length,
        })
    }
}
