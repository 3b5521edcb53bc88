use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use super::*;
use crate::alert::{Alert, AlertQueue};
use crate::constants::BLOCK_SIZE;
use crate::peer::{Bitfield, ConnectionEvent, PeerRequest, PieceBlock};

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn padded_layout() -> FileLayout {
    FileLayout::multi_file("tor", BLOCK_SIZE)
        .add_file("a.bin", 16284)
        .add_pad_file(100)
        .add_file("b.bin", 20000)
        .add_file("empty", 0)
        .add_file("c.bin", 12384)
}

// ============================================================================
// FileLayout
// ============================================================================

#[test]
fn test_single_file_layout() {
    let layout = FileLayout::single_file("file.bin", 40000, BLOCK_SIZE);
    assert!(!layout.is_multi_file());
    assert_eq!(layout.num_pieces(), 3);
    assert_eq!(layout.piece_size(0), BLOCK_SIZE);
    assert_eq!(layout.piece_size(2), 40000 - 2 * BLOCK_SIZE);
    assert_eq!(layout.piece_size(3), 0);
    assert_eq!(layout.blocks_in_piece(2, BLOCK_SIZE), 1);

    assert!(layout.is_valid_request(&PeerRequest::new(2, 0, 40000 - 2 * BLOCK_SIZE)));
    assert!(!layout.is_valid_request(&PeerRequest::new(2, 0, BLOCK_SIZE)));
    assert!(!layout.is_valid_request(&PeerRequest::new(3, 0, 1)));
    assert!(!layout.is_valid_request(&PeerRequest::new(0, 0, 0)));
}

#[test]
fn test_map_block_across_files() {
    let layout = padded_layout();
    assert_eq!(layout.total_length(), 48768);
    assert_eq!(layout.num_pieces(), 3);

    let slices = layout.map_block(0, 0, BLOCK_SIZE);
    assert_eq!(
        slices,
        vec![
            FileSlice { file_index: 0, offset: 0, size: 16284 },
            FileSlice { file_index: 1, offset: 0, size: 100 },
        ]
    );
    assert!(layout.file(1).unwrap().is_padding);
    assert_eq!(layout.file(1).unwrap().path, ".pad/100");

    // piece 2 starts inside b.bin and skips the empty file
    let slices = layout.map_block(2, 0, BLOCK_SIZE);
    assert_eq!(
        slices,
        vec![
            FileSlice { file_index: 2, offset: 16384, size: 3616 },
            FileSlice { file_index: 4, offset: 0, size: 12384 },
        ]
    );

    // clipped at the end of the torrent
    let slices = layout.map_block(2, 15616, BLOCK_SIZE);
    assert_eq!(slices, vec![FileSlice { file_index: 4, offset: 12000, size: 384 }]);
    assert!(layout.map_block(2, 16000, BLOCK_SIZE).is_empty());
}

#[test]
fn test_map_file_and_piece_ranges() {
    let layout = padded_layout();
    assert_eq!(
        layout.map_file(2, 100, 500),
        Some(PeerRequest::new(1, 100, 500))
    );
    assert_eq!(layout.map_file(9, 0, 1), None);
    assert_eq!(layout.pieces_in_file_range(2, 0, 20000), 1..3);
    assert_eq!(layout.pieces_in_file_range(0, 0, 16284), 0..1);
    assert_eq!(layout.pieces_in_file_range(2, 0, 0), 0..0);
    assert!(layout.file(2).unwrap().contains_offset(16384));
    assert_eq!(layout.file(2).unwrap().byte_range(), 16384..36384);
}

// ============================================================================
// SimplePicker
// ============================================================================

#[test]
fn test_picker_block_lifecycle() {
    let layout = FileLayout::single_file("f", 4 * BLOCK_SIZE as u64, 2 * BLOCK_SIZE);
    let picker = SimplePicker::new(&layout);
    let block = PieceBlock::new(0, 1);

    assert_eq!(picker.num_peers(block), 0);
    assert!(picker.mark_as_downloading(block));
    assert!(picker.mark_as_downloading(block));
    assert_eq!(picker.num_peers(block), 2);
    picker.abort_download(block);
    assert_eq!(picker.num_peers(block), 1);

    assert!(picker.mark_as_writing(block));
    assert!(!picker.mark_as_writing(block));
    assert!(picker.is_downloaded(block));
    picker.write_failed(block);
    assert!(!picker.is_downloaded(block));

    assert!(picker.mark_as_writing(block));
    picker.mark_as_finished(block);
    assert!(!picker.mark_as_downloading(block));
    assert!(!picker.is_piece_finished(0));
    picker.mark_as_finished(PieceBlock::new(0, 0));
    assert!(picker.is_piece_finished(0));

    picker.restore_piece(0);
    assert!(!picker.is_piece_finished(0));
    assert!(picker.is_wanted(0));
    picker.piece_passed(1);
    assert!(!picker.is_wanted(1));
}

#[test]
fn test_picker_prefers_suggested_and_offers_one_busy() {
    let layout = FileLayout::single_file("f", 4 * BLOCK_SIZE as u64, BLOCK_SIZE);
    let picker = SimplePicker::new(&layout);
    let all = Bitfield::full(4);

    let picks = picker.pick_blocks(&all, 2, 0, &[3], &[]);
    let blocks: Vec<_> = picks.iter().map(|p| p.block).collect();
    assert_eq!(blocks, vec![PieceBlock::new(3, 0), PieceBlock::new(0, 0)]);
    assert!(picks.iter().all(|p| !p.busy));

    for piece in 0..4 {
        picker.mark_as_downloading(PieceBlock::new(piece, 0));
    }
    let picks = picker.pick_blocks(&all, 2, 0, &[], &[]);
    assert_eq!(picks.len(), 1);
    assert!(picks[0].busy);

    let ignore = [PieceBlock::new(0, 0)];
    let picks = picker.pick_blocks(&all, 2, 0, &[], &ignore);
    assert_eq!(picks[0].block, PieceBlock::new(1, 0));
}

#[test]
fn test_picker_whole_pieces_and_have() {
    let layout = FileLayout::single_file("f", 8 * BLOCK_SIZE as u64, 4 * BLOCK_SIZE);
    let mut have = Bitfield::new(2);
    have.set_piece(0);
    let picker = SimplePicker::new(&layout).with_have(&have);

    let picks = picker.pick_blocks(&Bitfield::full(2), 1, 1, &[], &[]);
    assert_eq!(picks.len(), 4);
    assert!(picks.iter().all(|p| p.block.piece_index == 1));
    assert!(picker.is_piece_finished(0));
}

// ============================================================================
// MemoryDisk
// ============================================================================

#[test]
fn test_memory_disk_write_read_verify() {
    let data = content(2 * BLOCK_SIZE as usize);
    let layout = FileLayout::single_file("f", data.len() as u64, BLOCK_SIZE);
    let disk = MemoryDisk::new(&layout, MemoryDisk::hashes_for(&data, BLOCK_SIZE));

    let r = PeerRequest::new(1, 0, BLOCK_SIZE);
    let (tx, mut rx) = oneshot::channel();
    disk.async_write(
        r,
        Bytes::copy_from_slice(&data[BLOCK_SIZE as usize..]),
        Box::new(move |res| {
            let _ = tx.send(res);
        }),
    );
    assert_eq!(rx.try_recv().unwrap(), Ok(()));

    let (tx, mut rx) = oneshot::channel();
    disk.async_read(
        PeerRequest::new(1, 100, 10),
        Box::new(move |res| {
            let _ = tx.send(res);
        }),
    );
    let read = rx.try_recv().unwrap().unwrap();
    assert_eq!(read, &data[BLOCK_SIZE as usize + 100..BLOCK_SIZE as usize + 110]);

    let (tx, mut rx) = oneshot::channel();
    disk.async_verify_piece(
        1,
        Box::new(move |res| {
            let _ = tx.send(res);
        }),
    );
    assert_eq!(rx.try_recv().unwrap(), Ok(true));

    let (tx, mut rx) = oneshot::channel();
    disk.async_verify_piece(
        0,
        Box::new(move |res| {
            let _ = tx.send(res);
        }),
    );
    assert_eq!(rx.try_recv().unwrap(), Ok(false));

    let (tx, mut rx) = oneshot::channel();
    disk.async_write(
        PeerRequest::new(5, 0, 1),
        Bytes::from_static(b"x"),
        Box::new(move |res| {
            let _ = tx.send(res);
        }),
    );
    assert!(matches!(rx.try_recv().unwrap(), Err(DiskError::Write { .. })));
}

// ============================================================================
// Torrent
// ============================================================================

#[test]
fn test_block_written_finishes_piece() {
    let data = content(2 * BLOCK_SIZE as usize);
    let layout = FileLayout::single_file("f", data.len() as u64, 2 * BLOCK_SIZE);
    let disk = Arc::new(MemoryDisk::new(&layout, MemoryDisk::hashes_for(&data, 2 * BLOCK_SIZE)));
    let alerts = Arc::new(AlertQueue::new());
    let picker = Arc::new(SimplePicker::new(&layout));
    let torrent = Arc::new(Torrent::new(
        [1u8; 20],
        layout,
        picker,
        disk.clone(),
        alerts.clone(),
    ));
    let (_handle, mut events) = torrent.router().register();

    for block in 0..2u32 {
        let r = PeerRequest::new(0, block * BLOCK_SIZE, BLOCK_SIZE);
        let start = (block * BLOCK_SIZE) as usize;
        let chunk = Bytes::copy_from_slice(&data[start..start + BLOCK_SIZE as usize]);
        let t = Arc::clone(&torrent);
        torrent.picker().mark_as_writing(PieceBlock::new(0, block));
        torrent.disk().async_write(
            r,
            chunk,
            Box::new(move |res| t.on_block_written(r, &res, "peer")),
        );
    }

    assert!(torrent.have_piece(0));
    assert!(torrent.is_seed());
    assert!(matches!(events.try_recv(), Ok(ConnectionEvent::WeHave(0))));
    let alerts = alerts.pop_alerts();
    assert_eq!(
        alerts
            .iter()
            .filter(|a| matches!(a, Alert::BlockFinished { .. }))
            .count(),
        2
    );
    assert!(alerts
        .iter()
        .any(|a| matches!(a, Alert::PieceFinished { piece: 0 })));
}

#[test]
fn test_hash_failure_reopens_piece() {
    let data = content(BLOCK_SIZE as usize);
    let layout = FileLayout::single_file("f", data.len() as u64, BLOCK_SIZE);
    let disk = Arc::new(MemoryDisk::new(&layout, MemoryDisk::hashes_for(&data, BLOCK_SIZE)));
    let alerts = Arc::new(AlertQueue::new());
    let picker = Arc::new(SimplePicker::new(&layout));
    let torrent = Arc::new(Torrent::new([1u8; 20], layout, picker, disk, alerts.clone()));

    let r = PeerRequest::new(0, 0, BLOCK_SIZE);
    let block = PieceBlock::new(0, 0);
    torrent.picker().mark_as_writing(block);
    let t = Arc::clone(&torrent);
    torrent.disk().async_write(
        r,
        Bytes::from(vec![0u8; BLOCK_SIZE as usize]),
        Box::new(move |res| t.on_block_written(r, &res, "peer")),
    );

    assert!(!torrent.have_piece(0));
    assert!(!torrent.picker().is_downloaded(block));
    assert!(alerts
        .pop_alerts()
        .iter()
        .any(|a| matches!(a, Alert::HashFailed { piece: 0 })));
}

#[test]
fn test_failed_write_reopens_block() {
    let layout = FileLayout::single_file("f", BLOCK_SIZE as u64, BLOCK_SIZE);
    let disk = Arc::new(MemoryDisk::new(&layout, vec![[0u8; 20]]));
    let alerts = Arc::new(AlertQueue::new());
    let picker = Arc::new(SimplePicker::new(&layout));
    let torrent = Arc::new(Torrent::new([1u8; 20], layout, picker, disk, alerts.clone()));

    let r = PeerRequest::new(0, 0, BLOCK_SIZE);
    let block = PieceBlock::new(0, 0);
    torrent.picker().mark_as_writing(block);
    let t = Arc::clone(&torrent);
    torrent.disk().async_write(
        r,
        Bytes::from_static(b"short"),
        Box::new(move |res| t.on_block_written(r, &res, "peer")),
    );

    assert!(!torrent.picker().is_downloaded(block));
    assert!(alerts
        .pop_alerts()
        .iter()
        .any(|a| matches!(a, Alert::FileError { .. })));
}
