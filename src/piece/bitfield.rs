/// Which pieces a peer holds, one bit per piece index.
///
/// Bits are numbered from the high bit of the first byte, so piece `i` lives
/// in bit `7 - (i % 8)` of byte `i / 8`. Spare bits in the last byte are
/// always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl Bitfield {
    /// Bitfield with no pieces set
    pub fn new(piece_count: u32) -> Self {
        Self {
            bits: vec![0; Self::byte_len(piece_count)],
            piece_count,
        }
    }

    /// Bitfield with every piece set
    pub fn full(piece_count: u32) -> Self {
        let mut bitfield = Self {
            bits: vec![0xFF; Self::byte_len(piece_count)],
            piece_count,
        };
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Build from wire bytes; spare trailing bits are dropped.
    /// Returns `None` when the byte count does not fit `piece_count`.
    pub fn from_bytes(bytes: &[u8], piece_count: u32) -> Option<Self> {
        if bytes.len() != Self::byte_len(piece_count) {
            return None;
        }

        let mut bitfield = Self {
            bits: bytes.to_vec(),
            piece_count,
        };
        bitfield.clear_spare_bits();
        Some(bitfield)
    }

    /// Number of bytes needed on the wire for `piece_count` pieces
    pub fn byte_len(piece_count: u32) -> usize {
        (piece_count as usize).div_ceil(8)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn len(&self) -> u32 {
        self.piece_count
    }

    pub fn has(&self, index: u32) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] >> bit_index) & 1 == 1
    }

    pub fn set(&mut self, index: u32) {
        if index >= self.piece_count {
            return;
        }
        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
    }

    /// Number of pieces set
    pub fn count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Pieces set in `self` but missing from `other`
    pub fn missing_from<'a>(&'a self, other: &'a Bitfield) -> impl Iterator<Item = u32> + 'a {
        (0..self.piece_count).filter(move |&i| self.has(i) && !other.has(i))
    }

    /// True when `self` holds at least one piece `local` lacks
    pub fn is_interesting_to(&self, local: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(local.bits.iter())
            .any(|(remote, local)| remote & !local != 0)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count as usize;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFF << spare;
            }
        }
    }
}
