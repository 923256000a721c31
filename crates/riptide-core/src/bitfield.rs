use bitvec::prelude::{BitVec, Msb0};

type Bits = BitVec<u8, Msb0>;

/// Chunk presence bitfield in wire order: bit 0 is the most significant bit
/// of byte 0.
///
/// Maintains the number of set bits incrementally so `count_set` never scans.
/// The backing storage is always a whole number of bytes; bits past
/// `size_bits` are kept zero (`clear_tail`) so `as_bytes` is deterministic
/// and can go on the wire as-is.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Bits,
    set: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum BitfieldError {
    #[error("expected {expected} bytes for {bits} bits, got {got}")]
    WrongByteLength {
        expected: usize,
        got: usize,
        bits: usize,
    },
}

impl Bitfield {
    pub fn with_size(nbits: usize) -> Self {
        Bitfield {
            bits: Bits::repeat(false, nbits),
            set: 0,
        }
    }

    /// Builds a bitfield from wire bytes. Trailing bits in the final byte
    /// are cleared rather than rejected; the byte length must match exactly.
    pub fn from_bytes(bytes: &[u8], nbits: usize) -> Result<Self, BitfieldError> {
        let expected = nbits.div_ceil(8);
        if bytes.len() != expected {
            return Err(BitfieldError::WrongByteLength {
                expected,
                got: bytes.len(),
                bits: nbits,
            });
        }
        let mut bits = Bits::from_slice(bytes);
        bits.truncate(nbits);
        let mut bf = Bitfield { bits, set: 0 };
        bf.clear_tail();
        bf.update();
        Ok(bf)
    }

    pub fn size_bits(&self) -> usize {
        self.bits.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.bits.len().div_ceil(8)
    }

    pub fn count_set(&self) -> usize {
        self.set
    }

    pub fn is_all_set(&self) -> bool {
        self.set == self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set == 0
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn set(&mut self, index: usize) {
        if !self.bits.replace(index, true) {
            self.set += 1;
        }
    }

    pub fn unset(&mut self, index: usize) {
        if self.bits.replace(index, false) {
            self.set -= 1;
        }
    }

    pub fn set_range(&mut self, range: std::ops::Range<usize>) {
        for i in range {
            self.set(i);
        }
    }

    pub fn unset_range(&mut self, range: std::ops::Range<usize>) {
        for i in range {
            self.unset(i);
        }
    }

    pub fn set_all(&mut self) {
        self.bits.fill(true);
        self.set = self.bits.len();
    }

    pub fn unset_all(&mut self) {
        self.bits.fill(false);
        self.set = 0;
    }

    /// Recomputes the set counter with a wordwise population count. Only
    /// needed after byte-level mutation of the backing storage.
    pub fn update(&mut self) {
        self.set = self.bits.count_ones();
    }

    /// Zeroes the unused bits of the final byte so wire output stays
    /// deterministic after byte-level mutation.
    pub fn clear_tail(&mut self) {
        self.bits.set_uninitialized(false);
    }

    /// Wire-order bytes, tail bits zero.
    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    pub fn iter_unset(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_zeros()
    }
}

impl std::fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitfield({}/{})", self.set, self.bits.len())
    }
}
