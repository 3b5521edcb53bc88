use std::collections::HashSet;

use parking_lot::Mutex;

use super::file_layout::FileLayout;
use crate::constants::BLOCK_SIZE;
use crate::peer::{Bitfield, PieceBlock};

/// A block offered by the picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PickedBlock {
    pub block: PieceBlock,
    /// Already requested from another peer.
    pub busy: bool,
}

/// Block-level download state shared by every connection of a torrent.
///
/// Each method is one atomic step; implementations lock internally.
pub trait PiecePicker: Send + Sync {
    /// Suggests up to `num_blocks` blocks the peer can provide.
    ///
    /// With `prefer_whole_pieces` set, that many whole pieces are picked.
    /// Blocks in `ignore` are never returned. When no free block is left
    /// at most one already requested block is offered, tagged busy.
    fn pick_blocks(
        &self,
        peer_has: &Bitfield,
        num_blocks: usize,
        prefer_whole_pieces: u32,
        suggested: &[u32],
        ignore: &[PieceBlock],
    ) -> Vec<PickedBlock>;

    /// Records the block as requested from one more peer.
    ///
    /// Returns `false` if the block is already being written or finished.
    fn mark_as_downloading(&self, block: PieceBlock) -> bool;

    /// Records that the block's data arrived and is being written.
    ///
    /// Returns `false` if someone else already delivered it.
    fn mark_as_writing(&self, block: PieceBlock) -> bool;

    /// Gives up one peer's claim on the block.
    fn abort_download(&self, block: PieceBlock);

    /// Returns a block that could not be written to the open state.
    fn write_failed(&self, block: PieceBlock);

    /// Records the block as written to disk.
    fn mark_as_finished(&self, block: PieceBlock);

    /// Whether every block of the piece is on disk.
    fn is_piece_finished(&self, piece: u32) -> bool;

    /// Whether the block has been received, written or not.
    fn is_downloaded(&self, block: PieceBlock) -> bool;

    /// Number of peers the block is currently requested from.
    fn num_peers(&self, block: PieceBlock) -> u32;

    /// The piece passed its hash check.
    fn piece_passed(&self, piece: u32);

    /// The piece failed its hash check; all its blocks become open again.
    fn restore_piece(&self, piece: u32);

    /// Whether we want the piece at all.
    fn is_wanted(&self, piece: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Open,
    Requested(u32),
    Writing,
    Finished,
}

#[derive(Debug)]
struct PieceState {
    blocks: Vec<BlockState>,
    have: bool,
}

/// Picks blocks in piece order.
///
/// Rarest-first selection is the job of a real picker; this one exists so a
/// torrent can be driven end to end.
#[derive(Debug)]
pub struct SimplePicker {
    pieces: Mutex<Vec<PieceState>>,
}

impl SimplePicker {
    pub fn new(layout: &FileLayout) -> Self {
        let pieces = (0..layout.num_pieces())
            .map(|p| PieceState {
                blocks: vec![BlockState::Open; layout.blocks_in_piece(p, BLOCK_SIZE) as usize],
                have: false,
            })
            .collect();
        Self {
            pieces: Mutex::new(pieces),
        }
    }

    /// Marks pieces we already have, e.g. after resume.
    pub fn with_have(self, have: &Bitfield) -> Self {
        {
            let mut pieces = self.pieces.lock();
            for index in have.iter_set() {
                if let Some(p) = pieces.get_mut(index) {
                    p.have = true;
                    p.blocks.fill(BlockState::Finished);
                }
            }
        }
        self
    }

    fn with_block<R>(&self, block: PieceBlock, default: R, f: impl FnOnce(&mut BlockState) -> R) -> R {
        let mut pieces = self.pieces.lock();
        match pieces
            .get_mut(block.piece_index as usize)
            .and_then(|p| p.blocks.get_mut(block.block_index as usize))
        {
            Some(state) => f(state),
            None => default,
        }
    }
}

impl PiecePicker for SimplePicker {
    fn pick_blocks(
        &self,
        peer_has: &Bitfield,
        num_blocks: usize,
        prefer_whole_pieces: u32,
        suggested: &[u32],
        ignore: &[PieceBlock],
    ) -> Vec<PickedBlock> {
        let pieces = self.pieces.lock();
        let mut picked = Vec::new();
        let mut whole_pieces = 0;
        let mut busy = None;

        let order = suggested
            .iter()
            .copied()
            .chain(0..pieces.len() as u32)
            .filter(|&p| peer_has.has_piece(p as usize));

        let mut seen = HashSet::new();
        for piece in order {
            if !seen.insert(piece) {
                continue;
            }
            let Some(state) = pieces.get(piece as usize) else {
                continue;
            };
            if state.have {
                continue;
            }
            if prefer_whole_pieces > 0 {
                if whole_pieces >= prefer_whole_pieces && picked.len() >= num_blocks {
                    break;
                }
            } else if picked.len() >= num_blocks {
                break;
            }

            let mut took_any = false;
            for (i, s) in state.blocks.iter().enumerate() {
                let block = PieceBlock::new(piece, i as u32);
                if ignore.contains(&block) {
                    continue;
                }
                match s {
                    BlockState::Open => {
                        if prefer_whole_pieces == 0 && picked.len() >= num_blocks {
                            break;
                        }
                        picked.push(PickedBlock { block, busy: false });
                        took_any = true;
                    }
                    BlockState::Requested(_) if busy.is_none() => {
                        busy = Some(block);
                    }
                    _ => {}
                }
            }
            if took_any {
                whole_pieces += 1;
            }
        }

        if picked.is_empty() {
            if let Some(block) = busy {
                picked.push(PickedBlock { block, busy: true });
            }
        }
        picked
    }

    fn mark_as_downloading(&self, block: PieceBlock) -> bool {
        self.with_block(block, false, |state| match *state {
            BlockState::Open => {
                *state = BlockState::Requested(1);
                true
            }
            BlockState::Requested(n) => {
                *state = BlockState::Requested(n + 1);
                true
            }
            BlockState::Writing | BlockState::Finished => false,
        })
    }

    fn mark_as_writing(&self, block: PieceBlock) -> bool {
        self.with_block(block, false, |state| match *state {
            BlockState::Open | BlockState::Requested(_) => {
                *state = BlockState::Writing;
                true
            }
            BlockState::Writing | BlockState::Finished => false,
        })
    }

    fn abort_download(&self, block: PieceBlock) {
        self.with_block(block, (), |state| {
            if let BlockState::Requested(n) = *state {
                *state = if n > 1 {
                    BlockState::Requested(n - 1)
                } else {
                    BlockState::Open
                };
            }
        })
    }

    fn write_failed(&self, block: PieceBlock) {
        self.with_block(block, (), |state| {
            if *state == BlockState::Writing {
                *state = BlockState::Open;
            }
        })
    }

    fn mark_as_finished(&self, block: PieceBlock) {
        self.with_block(block, (), |state| *state = BlockState::Finished)
    }

    fn is_piece_finished(&self, piece: u32) -> bool {
        let pieces = self.pieces.lock();
        pieces
            .get(piece as usize)
            .is_some_and(|p| p.blocks.iter().all(|b| *b == BlockState::Finished))
    }

    fn is_downloaded(&self, block: PieceBlock) -> bool {
        self.with_block(block, false, |state| {
            matches!(*state, BlockState::Writing | BlockState::Finished)
        })
    }

    fn num_peers(&self, block: PieceBlock) -> u32 {
        self.with_block(block, 0, |state| match *state {
            BlockState::Requested(n) => n,
            _ => 0,
        })
    }

    fn piece_passed(&self, piece: u32) {
        if let Some(p) = self.pieces.lock().get_mut(piece as usize) {
            p.have = true;
        }
    }

    fn restore_piece(&self, piece: u32) {
        if let Some(p) = self.pieces.lock().get_mut(piece as usize) {
            p.have = false;
            p.blocks.fill(BlockState::Open);
        }
    }

    fn is_wanted(&self, piece: u32) -> bool {
        self.pieces
            .lock()
            .get(piece as usize)
            .is_some_and(|p| !p.have)
    }
}
