use bytes::Bytes;
use thiserror::Error;

use crate::peer::PeerRequest;

/// Failures reported by a disk backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiskError {
    #[error("write failed for {request}: {message}")]
    Write { request: PeerRequest, message: String },

    #[error("read failed for {request}: {message}")]
    Read { request: PeerRequest, message: String },

    #[error("cannot verify piece {piece}: {message}")]
    Verify { piece: u32, message: String },

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),
}

/// Completion handler for a disk job.
pub type DiskCallback<T> = Box<dyn FnOnce(Result<T, DiskError>) + Send + 'static>;

/// Asynchronous block storage.
///
/// Every job completes by invoking its callback exactly once, possibly on
/// another thread and after an arbitrary delay.
pub trait DiskIo: Send + Sync {
    fn async_write(&self, request: PeerRequest, data: Bytes, on_done: DiskCallback<()>);

    fn async_read(&self, request: PeerRequest, on_done: DiskCallback<Bytes>);

    /// Checks the piece against its hash; `Ok(false)` means a mismatch.
    fn async_verify_piece(&self, piece: u32, on_done: DiskCallback<bool>);
}
