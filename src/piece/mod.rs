mod bitfield;
mod picker;

pub use bitfield::Bitfield;
pub use picker::pick_piece;

use crate::error::{PeerError, Result};

/// How the shared file is cut into pieces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    file_size: u64,
    piece_size: u64,
    piece_count: u32,
}

impl PieceLayout {
    pub fn new(file_size: u64, piece_size: u64) -> Self {
        let piece_count = if piece_size == 0 {
            0
        } else {
            file_size.div_ceil(piece_size) as u32
        };

        Self {
            file_size,
            piece_size,
            piece_count,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Fails with `InvalidPieceIndex` when `index` is past the last piece
    pub fn check_index(&self, index: u32) -> Result<()> {
        if index < self.piece_count {
            Ok(())
        } else {
            Err(PeerError::InvalidPieceIndex {
                index,
                piece_count: self.piece_count,
            })
        }
    }

    /// Byte offset of a piece within the file
    pub fn offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_size
    }

    /// Length of a piece; the last piece may be shorter
    pub fn piece_len(&self, index: u32) -> usize {
        let start = self.offset(index);
        let end = std::cmp::min(start + self.piece_size, self.file_size);
        end.saturating_sub(start) as usize
    }

    /// Largest frame body a well-behaved peer can send: type byte,
    /// piece index and a full piece
    pub fn max_frame_len(&self) -> usize {
        let bitfield_len = (self.piece_count as usize).div_ceil(8);
        std::cmp::max(1 + 4 + self.piece_size as usize, 1 + bitfield_len)
    }
}
