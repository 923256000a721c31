/// The conventional transfer block size. Peers requesting more than
/// [`MAX_REQUEST_LEN`] per block are violating the protocol.
pub const BLOCK_LEN: u32 = 16 * 1024;

/// Largest REQUEST payload length we accept or emit.
pub const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// Largest wire packet: a PIECE carrying a max-size block plus its 9-byte
/// preamble. Anything longer is a framing violation.
pub const MAX_PACKET_LEN: u32 = MAX_REQUEST_LEN + 9;

/// Smallest piece length the metainfo validator accepts.
pub const MIN_CHUNK_LEN: u32 = BLOCK_LEN;
