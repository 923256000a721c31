use crate::constants::MIN_CHUNK_LEN;
use crate::hash_id::Id20;
use crate::layout::Layout;

/// A decoded metainfo dictionary.
///
/// Bencode decoding is the embedder's job; the engine consumes this model
/// and validates it before building a [`Layout`].
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: Id20,
    pub name: String,
    pub piece_length: u32,

    // Concatenated 20-byte SHA-1 digests, one per chunk.
    pub pieces: Vec<u8>,

    pub files: Vec<MetaFile>,

    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct MetaFile {
    pub length: u64,

    // Path components below the torrent root. Empty for single-file
    // torrents, where the torrent name is the file name.
    pub path: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum MetainfoError {
    #[error("piece length {0} is below the {MIN_CHUNK_LEN} byte minimum")]
    PieceLengthTooSmall(u32),
    #[error("piece length {0} is not a power of two")]
    PieceLengthNotPowerOfTwo(u32),
    #[error("pieces length {0} is not a multiple of 20")]
    PiecesNotDigestMultiple(usize),
    #[error("expected {expected} piece digests for {total_bytes} bytes, got {got}")]
    PieceCountMismatch {
        expected: u64,
        got: usize,
        total_bytes: u64,
    },
    #[error("torrent has no files")]
    NoFiles,
    #[error("file {0} has an empty path")]
    EmptyPath(usize),
}

impl Metainfo {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_bytes().div_ceil(self.piece_length as u64)
    }

    pub fn validate(&self) -> Result<(), MetainfoError> {
        if self.piece_length < MIN_CHUNK_LEN {
            return Err(MetainfoError::PieceLengthTooSmall(self.piece_length));
        }
        if !self.piece_length.is_power_of_two() {
            return Err(MetainfoError::PieceLengthNotPowerOfTwo(self.piece_length));
        }
        if self.files.is_empty() {
            return Err(MetainfoError::NoFiles);
        }
        for (i, f) in self.files.iter().enumerate() {
            if f.path.is_empty() && self.files.len() > 1 {
                return Err(MetainfoError::EmptyPath(i));
            }
        }
        if self.pieces.len() % 20 != 0 {
            return Err(MetainfoError::PiecesNotDigestMultiple(self.pieces.len()));
        }
        let expected = self.total_chunks();
        if self.pieces.len() as u64 / 20 != expected {
            return Err(MetainfoError::PieceCountMismatch {
                expected,
                got: self.pieces.len() / 20,
                total_bytes: self.total_bytes(),
            });
        }
        Ok(())
    }

    pub fn layout(&self) -> anyhow::Result<Layout> {
        self.validate()?;
        Layout::new(self.total_bytes(), self.piece_length)
    }

    /// Expected hash of a chunk. Callers index within `total_chunks`.
    pub fn chunk_hash(&self, index: u32) -> Option<&[u8]> {
        let start = index as usize * 20;
        self.pieces.get(start..start + 20)
    }

    /// Tracker tiers: `announce-list` if present, else a single tier with
    /// `announce`, else nothing.
    pub fn announce_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            return self.announce_list.clone();
        }
        match &self.announce {
            Some(url) => vec![vec![url.clone()]],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(piece_length: u32, lengths: &[u64]) -> Metainfo {
        let total: u64 = lengths.iter().sum();
        let chunks = total.div_ceil(piece_length as u64);
        Metainfo {
            info_hash: Id20::new([1; 20]),
            name: "test".into(),
            piece_length,
            pieces: vec![0u8; (chunks * 20) as usize],
            files: lengths
                .iter()
                .enumerate()
                .map(|(i, len)| MetaFile {
                    length: *len,
                    path: vec![format!("f{i}")],
                })
                .collect(),
            announce: Some("http://tracker.example/announce".into()),
            announce_list: Vec::new(),
        }
    }

    #[test]
    fn accepts_valid() {
        assert!(meta(32 * 1024, &[100_000, 50_000]).validate().is_ok());
    }

    #[test]
    fn rejects_bad_piece_length() {
        assert!(matches!(
            meta(8 * 1024, &[100_000]).validate(),
            Err(MetainfoError::PieceLengthTooSmall(_))
        ));
        assert!(matches!(
            meta(48 * 1024, &[100_000]).validate(),
            Err(MetainfoError::PieceLengthNotPowerOfTwo(_))
        ));
    }

    #[test]
    fn rejects_digest_mismatch() {
        let mut m = meta(32 * 1024, &[100_000]);
        m.pieces.truncate(20);
        assert!(matches!(
            m.validate(),
            Err(MetainfoError::PieceCountMismatch { .. })
        ));
        m.pieces.truncate(19);
        assert!(matches!(
            m.validate(),
            Err(MetainfoError::PiecesNotDigestMultiple(19))
        ));
    }

    #[test]
    fn tier_fallback() {
        let mut m = meta(32 * 1024, &[1000]);
        assert_eq!(m.announce_tiers().len(), 1);
        m.announce_list = vec![
            vec!["http://a/announce".into(), "http://b/announce".into()],
            vec!["http://c/announce".into()],
        ];
        assert_eq!(m.announce_tiers().len(), 2);
        assert_eq!(m.announce_tiers()[0].len(), 2);
    }
}
