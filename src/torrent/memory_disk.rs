use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use sha1::{Digest, Sha1};
use tracing::trace;

use super::disk::{DiskCallback, DiskError, DiskIo};
use super::file_layout::FileLayout;
use crate::peer::PeerRequest;

/// Keeps piece data in memory and checks it against SHA-1 piece hashes.
///
/// Jobs complete synchronously, before the call returns.
#[derive(Debug)]
pub struct MemoryDisk {
    piece_sizes: Vec<u32>,
    hashes: Vec<[u8; 20]>,
    pieces: DashMap<u32, BytesMut>,
}

impl MemoryDisk {
    /// Creates an empty store. `hashes` holds one SHA-1 per piece.
    pub fn new(layout: &FileLayout, hashes: Vec<[u8; 20]>) -> Self {
        Self {
            piece_sizes: (0..layout.num_pieces()).map(|p| layout.piece_size(p)).collect(),
            hashes,
            pieces: DashMap::new(),
        }
    }

    /// Creates a store already holding `content`, with hashes computed from it.
    pub fn seeded(layout: &FileLayout, content: &[u8]) -> Self {
        let pl = layout.piece_length().max(1);
        let disk = Self::new(layout, Self::hashes_for(content, pl));
        for (i, chunk) in content.chunks(pl as usize).enumerate() {
            disk.pieces.insert(i as u32, BytesMut::from(chunk));
        }
        disk
    }

    /// Hashes for `content` split into pieces of `piece_length`.
    pub fn hashes_for(content: &[u8], piece_length: u32) -> Vec<[u8; 20]> {
        content
            .chunks(piece_length.max(1) as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect()
    }

    /// Contents of a piece as written so far.
    pub fn piece(&self, piece: u32) -> Option<Bytes> {
        self.pieces.get(&piece).map(|p| Bytes::copy_from_slice(&p))
    }

    fn check(&self, request: &PeerRequest) -> bool {
        self.piece_sizes
            .get(request.piece as usize)
            .is_some_and(|&size| request.start as u64 + request.length as u64 <= size as u64)
    }
}

impl DiskIo for MemoryDisk {
    fn async_write(&self, request: PeerRequest, data: Bytes, on_done: DiskCallback<()>) {
        if !self.check(&request) || data.len() != request.length as usize {
            on_done(Err(DiskError::Write {
                request,
                message: "out of range".into(),
            }));
            return;
        }
        trace!(%request, "memory write");
        {
            let size = self.piece_sizes[request.piece as usize] as usize;
            let mut piece = self
                .pieces
                .entry(request.piece)
                .or_insert_with(|| BytesMut::zeroed(size));
            let start = request.start as usize;
            piece[start..start + data.len()].copy_from_slice(&data);
        }
        on_done(Ok(()));
    }

    fn async_read(&self, request: PeerRequest, on_done: DiskCallback<Bytes>) {
        if !self.check(&request) {
            on_done(Err(DiskError::Read {
                request,
                message: "out of range".into(),
            }));
            return;
        }
        let result = match self.pieces.get(&request.piece) {
            Some(piece) => {
                let start = request.start as usize;
                Ok(Bytes::copy_from_slice(
                    &piece[start..start + request.length as usize],
                ))
            }
            None => Err(DiskError::Read {
                request,
                message: "piece not present".into(),
            }),
        };
        on_done(result);
    }

    fn async_verify_piece(&self, piece: u32, on_done: DiskCallback<bool>) {
        let Some(expected) = self.hashes.get(piece as usize) else {
            on_done(Err(DiskError::InvalidPieceIndex(piece)));
            return;
        };
        let result = match self.pieces.get(&piece) {
            Some(data) => {
                let digest: [u8; 20] = Sha1::digest(&data[..]).into();
                Ok(digest == *expected)
            }
            None => Ok(false),
        };
        trace!(piece, ?result, "memory verify");
        on_done(result);
    }
}

