pub mod bitfield;
pub mod constants;
pub mod hash_id;
pub mod layout;
pub mod metainfo;
pub mod peer_id;
pub mod resume;

pub use bitfield::Bitfield;
pub use hash_id::Id20;
pub use layout::{BlockInfo, ChunkIndex, Layout};
