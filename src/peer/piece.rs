use std::fmt;

/// A byte range inside a piece.
///
/// `start + length` never exceeds the size of `piece` and `length` is
/// non-zero for any request that made it past validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerRequest {
    pub piece: u32,
    pub start: u32,
    pub length: u32,
}

impl PeerRequest {
    pub fn new(piece: u32, start: u32, length: u32) -> Self {
        Self {
            piece,
            start,
            length,
        }
    }

    /// Absolute byte offset of the first byte within the torrent.
    pub fn torrent_offset(&self, piece_length: u32) -> u64 {
        self.piece as u64 * piece_length as u64 + self.start as u64
    }

    /// The block this request starts at, if it is block aligned.
    pub fn block(&self, block_size: u32) -> Option<PieceBlock> {
        if self.start % block_size != 0 {
            return None;
        }
        Some(PieceBlock::new(self.piece, self.start / block_size))
    }
}

impl fmt::Display for PeerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "piece: {} | s: {} | l: {}",
            self.piece, self.start, self.length
        )
    }
}

/// Addresses one block of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceBlock {
    pub piece_index: u32,
    pub block_index: u32,
}

impl PieceBlock {
    pub fn new(piece_index: u32, block_index: u32) -> Self {
        Self {
            piece_index,
            block_index,
        }
    }

    /// Byte offset of the block within its piece.
    pub fn offset(&self, block_size: u32) -> u32 {
        self.block_index * block_size
    }
}

impl fmt::Display for PieceBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "piece: {} | b: {}", self.piece_index, self.block_index)
    }
}

/// A block this connection has asked for, plus bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBlock {
    pub block: PieceBlock,
    /// Also requested from another peer (end-game).
    pub busy: bool,
    /// Given back to the picker after a timeout; may still arrive late.
    pub timed_out: bool,
    /// Cancelled; if it arrives anyway it is discarded.
    pub not_wanted: bool,
    /// Number of later requests answered before this one.
    pub skipped: u32,
}

impl PendingBlock {
    pub fn new(block: PieceBlock) -> Self {
        Self {
            block,
            busy: false,
            timed_out: false,
            not_wanted: false,
            skipped: 0,
        }
    }

    pub fn busy(block: PieceBlock) -> Self {
        Self {
            busy: true,
            ..Self::new(block)
        }
    }

    /// Whether the block still counts against the desired queue size.
    pub fn is_active(&self) -> bool {
        !self.timed_out && !self.not_wanted
    }
}

/// Progress of the block currently being received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceBlockProgress {
    pub piece_index: u32,
    pub block_index: u32,
    pub bytes_downloaded: u32,
    pub full_block_bytes: u32,
}

pub fn compute_block_count(piece_length: u64, block_size: u32) -> u32 {
    piece_length.div_ceil(block_size as u64) as u32
}

pub fn compute_block_length(piece_length: u64, block_index: u32, block_size: u32) -> u32 {
    let offset = block_index as u64 * block_size as u64;
    let remaining = piece_length.saturating_sub(offset);
    remaining.min(block_size as u64) as u32
}
