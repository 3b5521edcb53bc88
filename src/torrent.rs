//! Per-torrent context shared by all connections.
//!
//! Connections never own torrent state. They hold an `Arc<Torrent>` and go
//! through its collaborators:
//!
//! - [`FileLayout`] - piece sizes and the piece-to-file mapping
//! - [`PiecePicker`] - which blocks are requested, written or finished
//! - [`DiskIo`] - asynchronous block reads, writes and hash checks
//! - [`AlertSink`] - where events are reported
//! - [`BandwidthLimiter`] - transfer quota
//! - [`WebSeedList`] - web seed bookkeeping that outlives connections
//! - [`EventRouter`] - delivers completions back to connections
//!
//! [`SimplePicker`] and [`MemoryDisk`] are small in-process implementations
//! of the picker and disk interfaces.

mod disk;
mod file_layout;
mod memory_disk;
mod picker;

pub use disk::{DiskCallback, DiskError, DiskIo};
pub use file_layout::{FileEntry, FileLayout, FileSlice};
pub use memory_disk::MemoryDisk;
pub use picker::{PickedBlock, PiecePicker, SimplePicker};

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::alert::{Alert, AlertSink};
use crate::bandwidth::BandwidthLimiter;
use crate::constants::BLOCK_SIZE;
use crate::peer::{Bitfield, ConnectionEvent, EventRouter, PeerRequest, PieceBlock};
use crate::webseed::WebSeedList;

pub struct Torrent {
    info_hash: [u8; 20],
    layout: FileLayout,
    have: RwLock<Bitfield>,
    verifying: Mutex<HashSet<u32>>,
    picker: Arc<dyn PiecePicker>,
    disk: Arc<dyn DiskIo>,
    alerts: Arc<dyn AlertSink>,
    bandwidth: Arc<BandwidthLimiter>,
    web_seeds: WebSeedList,
    router: EventRouter,
}

impl Torrent {
    pub fn new(
        info_hash: [u8; 20],
        layout: FileLayout,
        picker: Arc<dyn PiecePicker>,
        disk: Arc<dyn DiskIo>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let have = Bitfield::new(layout.num_pieces() as usize);
        Self {
            info_hash,
            layout,
            have: RwLock::new(have),
            verifying: Mutex::new(HashSet::new()),
            picker,
            disk,
            alerts,
            bandwidth: Arc::new(BandwidthLimiter::unlimited()),
            web_seeds: WebSeedList::new(),
            router: EventRouter::new(),
        }
    }

    pub fn with_bandwidth(mut self, bandwidth: Arc<BandwidthLimiter>) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    /// Starts with the given pieces already verified.
    pub fn with_have(self, have: Bitfield) -> Self {
        *self.have.write() = have;
        self
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    pub fn num_pieces(&self) -> u32 {
        self.layout.num_pieces()
    }

    pub fn have_piece(&self, piece: u32) -> bool {
        self.have.read().has_piece(piece as usize)
    }

    pub fn have_bitfield(&self) -> Bitfield {
        self.have.read().clone()
    }

    pub fn num_have(&self) -> usize {
        self.have.read().count()
    }

    pub fn is_seed(&self) -> bool {
        self.have.read().is_complete()
    }

    pub fn picker(&self) -> &dyn PiecePicker {
        self.picker.as_ref()
    }

    pub fn disk(&self) -> &dyn DiskIo {
        self.disk.as_ref()
    }

    pub fn alerts(&self) -> &dyn AlertSink {
        self.alerts.as_ref()
    }

    pub fn post_alert(&self, alert: Alert) {
        self.alerts.post_alert(alert);
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthLimiter> {
        &self.bandwidth
    }

    pub fn web_seeds(&self) -> &WebSeedList {
        &self.web_seeds
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Records a finished block write.
    ///
    /// Runs from the disk completion itself, so the picker is updated even
    /// if the connection that received the block is already gone.
    pub fn on_block_written(
        self: &Arc<Self>,
        request: PeerRequest,
        result: &Result<(), DiskError>,
        peer: &str,
    ) {
        let block = PieceBlock::new(request.piece, request.start / BLOCK_SIZE);
        match result {
            Ok(()) => {
                self.picker.mark_as_finished(block);
                self.post_alert(Alert::BlockFinished {
                    peer: peer.to_string(),
                    piece: block.piece_index,
                    block: block.block_index,
                });
                if self.picker.is_piece_finished(request.piece) {
                    self.verify_piece(request.piece);
                }
            }
            Err(e) => {
                warn!(%request, error = %e, "block write failed");
                self.picker.write_failed(block);
                self.post_alert(Alert::FileError {
                    message: e.to_string(),
                });
            }
        }
    }

    /// Starts a hash check of a piece whose blocks are all on disk.
    ///
    /// Only one check per piece is in flight at a time.
    pub fn verify_piece(self: &Arc<Self>, piece: u32) {
        if !self.verifying.lock().insert(piece) {
            return;
        }
        debug!(piece, "verifying piece");
        let torrent = Arc::clone(self);
        self.disk.async_verify_piece(
            piece,
            Box::new(move |result| torrent.on_piece_verified(piece, result)),
        );
    }

    fn on_piece_verified(&self, piece: u32, result: Result<bool, DiskError>) {
        self.verifying.lock().remove(&piece);
        match result {
            Ok(true) => {
                self.have.write().set_piece(piece as usize);
                self.picker.piece_passed(piece);
                self.post_alert(Alert::PieceFinished { piece });
                self.router.broadcast(ConnectionEvent::WeHave(piece));
            }
            Ok(false) => {
                warn!(piece, "piece failed hash check");
                self.picker.restore_piece(piece);
                self.post_alert(Alert::HashFailed { piece });
            }
            Err(e) => {
                warn!(piece, error = %e, "piece verification failed");
                self.picker.restore_piece(piece);
                self.post_alert(Alert::FileError {
                    message: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests;
