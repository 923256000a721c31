use riptide_peer_protocol::MessageError;

/// Why a peer got disconnected for breaking the protocol. Routed to the
/// connection list, never allowed to take down the engine.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolViolation {
    #[error(transparent)]
    Framing(#[from] MessageError),
    #[error("BITFIELD after other messages")]
    LateBitfield,
    #[error("bitfield of {got} bytes, expected {expected}")]
    BitfieldWrongSize { got: usize, expected: usize },
    #[error("chunk index {0} out of range")]
    BadChunkIndex(u32),
    #[error("request of {0} bytes exceeds the limit")]
    RequestTooLong(u32),
    #[error("request for a block we don't serve: index={index} begin={begin} length={length}")]
    BadRequest { index: u32, begin: u32, length: u32 },
    #[error("handshake info hash mismatch")]
    WrongInfoHash,
    #[error("peer id is our own")]
    ConnectedToOurselves,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("chunk {0} is queued for hashing")]
    ChunkBusyHashing(u32),
    #[error("chunk {0} is pinned and cannot be remapped")]
    ChunkPinned(u32),
    #[error("chunk memory budget exceeded")]
    ChunkBudgetExceeded,

    #[error("error connecting: {0:#}")]
    Connect(#[source] std::io::Error),
    #[error("error reading: {0:#}")]
    Read(#[source] std::io::Error),
    #[error("error writing: {0:#}")]
    Write(#[source] std::io::Error),
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("timeout: {0}")]
    Timeout(&'static str),

    #[error("peer is idle")]
    PeerIdle,
    #[error("both sides are seeders")]
    BothSeeders,
    #[error("connection limit reached")]
    ConnectionLimit,
    #[error("duplicate connection")]
    DuplicateConnection,

    #[error("download is stopped")]
    DownloadStopped,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors that count against the peer (failed counter) rather than us;
    /// such addresses are not requeued for reconnection.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Timeout(_) | Error::PeerIdle
        )
    }
}
