use crate::peer::{compute_block_count, compute_block_length, PeerRequest};

/// One file of a torrent, positioned in the torrent's byte space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the torrent root, `/`-separated.
    pub path: String,
    pub length: u64,
    /// Offset of the first byte within the torrent.
    pub offset: u64,
    /// Padding files are all zeros and are never transferred.
    pub is_padding: bool,
}

impl FileEntry {
    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.length
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.offset + self.length
    }
}

/// A run of bytes inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    /// Offset within the file.
    pub offset: u64,
    pub size: u64,
}

/// How a torrent's byte space maps onto pieces and files.
#[derive(Debug, Clone)]
pub struct FileLayout {
    name: String,
    files: Vec<FileEntry>,
    piece_length: u32,
    total_length: u64,
    multi_file: bool,
}

impl FileLayout {
    /// A torrent consisting of a single file.
    pub fn single_file(name: impl Into<String>, length: u64, piece_length: u32) -> Self {
        let name = name.into();
        Self {
            files: vec![FileEntry {
                path: name.clone(),
                length,
                offset: 0,
                is_padding: false,
            }],
            name,
            piece_length,
            total_length: length,
            multi_file: false,
        }
    }

    /// An empty multi-file torrent rooted at directory `name`.
    pub fn multi_file(name: impl Into<String>, piece_length: u32) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
            piece_length,
            total_length: 0,
            multi_file: true,
        }
    }

    /// Appends a regular file.
    pub fn add_file(mut self, path: impl Into<String>, length: u64) -> Self {
        self.push(path.into(), length, false);
        self
    }

    /// Appends a padding file.
    pub fn add_pad_file(mut self, length: u64) -> Self {
        let path = format!(".pad/{}", length);
        self.push(path, length, true);
        self
    }

    fn push(&mut self, path: String, length: u64, is_padding: bool) {
        self.files.push(FileEntry {
            path,
            length,
            offset: self.total_length,
            is_padding,
        });
        self.total_length += length;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn file(&self, index: usize) -> Option<&FileEntry> {
        self.files.get(index)
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Nominal piece length; only the last piece may be shorter.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn num_pieces(&self) -> u32 {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_length.div_ceil(self.piece_length as u64) as u32
    }

    /// Size of `piece`, zero if out of range.
    pub fn piece_size(&self, piece: u32) -> u32 {
        let start = piece as u64 * self.piece_length as u64;
        if start >= self.total_length {
            return 0;
        }
        (self.total_length - start).min(self.piece_length as u64) as u32
    }

    pub fn blocks_in_piece(&self, piece: u32, block_size: u32) -> u32 {
        compute_block_count(self.piece_size(piece) as u64, block_size)
    }

    pub fn block_size(&self, piece: u32, block: u32, block_size: u32) -> u32 {
        compute_block_length(self.piece_size(piece) as u64, block, block_size)
    }

    /// Whether `r` names a non-empty range inside an existing piece.
    pub fn is_valid_request(&self, r: &PeerRequest) -> bool {
        r.piece < self.num_pieces()
            && r.length > 0
            && r.start as u64 + r.length as u64 <= self.piece_size(r.piece) as u64
    }

    /// Maps `size` bytes at `start` within `piece` onto file slices.
    ///
    /// Zero-length files are skipped.
    pub fn map_block(&self, piece: u32, start: u32, size: u32) -> Vec<FileSlice> {
        let mut current = piece as u64 * self.piece_length as u64 + start as u64;
        let mut remaining = (size as u64).min(self.total_length.saturating_sub(current));
        let mut slices = Vec::new();

        for (file_index, file) in self.files.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if file.length == 0 || !file.contains_offset(current) {
                continue;
            }
            let take = remaining.min(file.offset + file.length - current);
            slices.push(FileSlice {
                file_index,
                offset: current - file.offset,
                size: take,
            });
            current += take;
            remaining -= take;
        }

        slices
    }

    /// Maps a range of a file back onto the piece it starts in.
    ///
    /// The returned request may extend past the end of the piece.
    pub fn map_file(&self, file_index: usize, offset: u64, size: u32) -> Option<PeerRequest> {
        let file = self.files.get(file_index)?;
        if self.piece_length == 0 {
            return None;
        }
        let absolute = file.offset + offset;
        Some(PeerRequest {
            piece: (absolute / self.piece_length as u64) as u32,
            start: (absolute % self.piece_length as u64) as u32,
            length: size,
        })
    }

    /// Pieces overlapping `size` bytes at `offset` of a file.
    pub fn pieces_in_file_range(&self, file_index: usize, offset: u64, size: u64) -> std::ops::Range<u32> {
        let Some(file) = self.files.get(file_index) else {
            return 0..0;
        };
        if self.piece_length == 0 || size == 0 {
            return 0..0;
        }
        let start = file.offset + offset;
        let end = start + size;
        let pl = self.piece_length as u64;
        (start / pl) as u32..end.div_ceil(pl) as u32
    }
}
