use crate::constants::BLOCK_LEN;

/// A chunk index that has been checked against the torrent's geometry.
///
/// Constructed only through [`Layout::validate_chunk`], so holders can index
/// without re-checking bounds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkIndex(u32);

impl ChunkIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One transfer block within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub chunk: ChunkIndex,

    // Index of the block within its chunk.
    pub block_index: u32,

    // Byte offset of the block within its chunk.
    pub offset: u32,
    pub len: u32,
}

/// Torrent geometry: how the byte stream divides into chunks and blocks.
///
/// All chunks have the same length except possibly the last one. Blocks are
/// `BLOCK_LEN` except the last block of a chunk.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    total_bytes: u64,
    chunk_len: u32,
    last_chunk: u32,
    last_chunk_len: u32,
    blocks_per_chunk: u32,
}

fn tail_len(total: u64, step: u64) -> u64 {
    let rem = total % step;
    if rem == 0 { step } else { rem }
}

impl Layout {
    pub fn new(total_bytes: u64, chunk_len: u32) -> anyhow::Result<Self> {
        if total_bytes == 0 {
            anyhow::bail!("torrent of zero length");
        }
        if chunk_len == 0 {
            anyhow::bail!("chunk length of zero");
        }
        let total_chunks = total_bytes.div_ceil(chunk_len as u64) as u32;
        Ok(Self {
            total_bytes,
            chunk_len,
            last_chunk: total_chunks - 1,
            last_chunk_len: tail_len(total_bytes, chunk_len as u64) as u32,
            blocks_per_chunk: chunk_len.div_ceil(BLOCK_LEN),
        })
    }

    pub const fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub const fn total_chunks(&self) -> u32 {
        self.last_chunk + 1
    }

    pub const fn default_chunk_len(&self) -> u32 {
        self.chunk_len
    }

    pub const fn last_chunk(&self) -> ChunkIndex {
        ChunkIndex(self.last_chunk)
    }

    pub const fn validate_chunk(&self, index: u32) -> Option<ChunkIndex> {
        if index > self.last_chunk {
            return None;
        }
        Some(ChunkIndex(index))
    }

    pub const fn chunk_len(&self, index: ChunkIndex) -> u32 {
        if index.0 == self.last_chunk {
            self.last_chunk_len
        } else {
            self.chunk_len
        }
    }

    pub const fn chunk_offset(&self, index: ChunkIndex) -> u64 {
        index.0 as u64 * self.chunk_len as u64
    }

    pub const fn blocks_in_chunk(&self, index: ChunkIndex) -> u32 {
        self.chunk_len(index).div_ceil(BLOCK_LEN)
    }

    pub const fn default_blocks_per_chunk(&self) -> u32 {
        self.blocks_per_chunk
    }

    /// Length of a given block, or `None` if the block index is out of range.
    pub fn block_len(&self, chunk: ChunkIndex, block_index: u32) -> Option<u32> {
        let blocks = self.blocks_in_chunk(chunk);
        if block_index + 1 < blocks {
            Some(BLOCK_LEN)
        } else if block_index + 1 == blocks {
            Some(tail_len(self.chunk_len(chunk) as u64, BLOCK_LEN as u64) as u32)
        } else {
            None
        }
    }

    pub fn block(&self, chunk: ChunkIndex, block_index: u32) -> Option<BlockInfo> {
        let len = self.block_len(chunk, block_index)?;
        Some(BlockInfo {
            chunk,
            block_index,
            offset: block_index * BLOCK_LEN,
            len,
        })
    }

    /// Validates an (index, begin, length) triple as received in a PIECE
    /// message against block geometry.
    pub fn block_from_wire(&self, chunk: ChunkIndex, begin: u32, len: u32) -> Option<BlockInfo> {
        if begin % BLOCK_LEN != 0 {
            return None;
        }
        let info = self.block(chunk, begin / BLOCK_LEN)?;
        if info.len != len {
            return None;
        }
        Some(info)
    }

    pub fn iter_blocks(&self, chunk: ChunkIndex) -> impl Iterator<Item = BlockInfo> + '_ {
        (0..self.blocks_in_chunk(chunk)).map(move |i| {
            // Index is in range, so this cannot fail.
            self.block(chunk, i).unwrap()
        })
    }

    pub fn iter_chunks(&self) -> impl Iterator<Item = ChunkIndex> {
        (0..=self.last_chunk).map(ChunkIndex)
    }

    /// Chunk indices overlapping the byte range `[offset, offset + len)`,
    /// clamped to the torrent. Used to derive per-file chunk ranges.
    pub fn chunks_spanning(&self, offset: u64, len: u64) -> std::ops::Range<u32> {
        let offset = offset.min(self.total_bytes);
        let end = (offset + len).min(self.total_bytes);
        let first = (offset / self.chunk_len as u64) as u32;
        if end == offset {
            return first..first;
        }
        first..end.div_ceil(self.chunk_len as u64) as u32
    }

    /// How many bytes of chunk `index` fall within the byte range
    /// `[offset, offset + len)`. Handles boundary chunks shared by two files.
    pub fn chunk_bytes_within(&self, index: ChunkIndex, offset: u64, len: u64) -> u64 {
        let chunk_start = self.chunk_offset(index);
        let chunk_end = chunk_start + self.chunk_len(index) as u64;
        let start = offset.max(chunk_start);
        let end = (offset + len).min(chunk_end);
        end.saturating_sub(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        // 71 chunks of 256 KiB, short 100352 byte tail.
        Layout::new(18 * 1024 * 1024 + 100352, 256 * 1024).unwrap()
    }

    #[test]
    fn chunk_geometry() {
        let l = layout();
        assert_eq!(l.total_chunks(), 73);
        let first = l.validate_chunk(0).unwrap();
        let last = l.last_chunk();
        assert_eq!(l.chunk_len(first), 256 * 1024);
        assert_eq!(l.chunk_len(last), 100352);
        assert!(l.validate_chunk(73).is_none());
    }

    #[test]
    fn block_geometry() {
        let l = layout();
        let last = l.last_chunk();
        assert_eq!(l.blocks_in_chunk(l.validate_chunk(0).unwrap()), 16);
        assert_eq!(l.blocks_in_chunk(last), 7);
        assert_eq!(l.block_len(last, 0), Some(BLOCK_LEN));
        assert_eq!(l.block_len(last, 6), Some(2048));
        assert_eq!(l.block_len(last, 7), None);
    }

    #[test]
    fn short_single_chunk() {
        let l = Layout::new(9000, 16384).unwrap();
        assert_eq!(l.total_chunks(), 1);
        let c = l.last_chunk();
        assert_eq!(l.chunk_len(c), 9000);
        assert_eq!(l.blocks_in_chunk(c), 1);
        assert_eq!(l.block_len(c, 0), Some(9000));
    }

    #[test]
    fn wire_block_validation() {
        let l = layout();
        let c = l.validate_chunk(1).unwrap();
        assert!(l.block_from_wire(c, 0, BLOCK_LEN).is_some());
        assert!(l.block_from_wire(c, BLOCK_LEN, BLOCK_LEN).is_some());
        // Misaligned begin.
        assert!(l.block_from_wire(c, 1, BLOCK_LEN).is_none());
        // Wrong length for the block.
        assert!(l.block_from_wire(c, 0, BLOCK_LEN - 1).is_none());
        // Short tail block of the short last chunk.
        assert!(l.block_from_wire(l.last_chunk(), 6 * BLOCK_LEN, 2048).is_some());
    }

    #[test]
    fn spanning_ranges() {
        let l = Layout::new(21, 10).unwrap();
        assert_eq!(l.chunks_spanning(0, 5), 0..1);
        assert_eq!(l.chunks_spanning(0, 11), 0..2);
        assert_eq!(l.chunks_spanning(10, 0), 1..1);
        assert_eq!(l.chunks_spanning(5, 16), 0..3);
        assert_eq!(l.chunks_spanning(20, 1000), 2..3);
        assert_eq!(l.chunks_spanning(21, 1), 2..2);
    }

    #[test]
    fn bytes_within() {
        let l = Layout::new(10, 5).unwrap();
        let c0 = l.validate_chunk(0).unwrap();
        let c1 = l.validate_chunk(1).unwrap();
        assert_eq!(l.chunk_bytes_within(c0, 0, 10), 5);
        assert_eq!(l.chunk_bytes_within(c0, 1, 10), 4);
        assert_eq!(l.chunk_bytes_within(c1, 6, 4), 4);
        assert_eq!(l.chunk_bytes_within(c1, 0, 5), 0);
    }
}
