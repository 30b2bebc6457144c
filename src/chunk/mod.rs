//! Chunk-domain types shared by the replication core and its collaborator
//! seams.

mod buffer;
mod manager;

use serde::{Deserialize, Serialize};

pub use buffer::{Admission, BufferGrant, BufferManager, BufferWait};
pub use manager::{ChunkManager, ChunkWrite};

/// File ID type.
pub type FileId = i64;

/// Chunk ID type.
pub type ChunkId = i64;

/// Chunk version number type. Version 0 is the never-used sentinel a chunk
/// file carries while a replication is still streaming into it.
pub type ChunkVersion = i64;

/// Fixed size of a full chunk in bytes.
pub const CHUNK_SIZE: i64 = 64 << 20;

/// Size of a checksum block, the smallest unit of chunk data carrying an
/// independent checksum. All non-tail writes are aligned to it.
pub const CHECKSUM_BLOCK_SIZE: usize = 64 << 10;

/// On-disk chunk file header size; also the floor for buffer admission.
pub const CHUNK_HEADER_SIZE: i64 = 16 << 10;

/// Default IO buffer granularity of the disk subsystem.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 4 << 10;

/// Stripe geometry bounds for RS-encoded files.
pub const STRIPE_ALIGNMENT: i64 = 4 << 10;
pub const MIN_STRIPE_SIZE: i64 = STRIPE_ALIGNMENT;
pub const MAX_STRIPE_SIZE: i64 = CHUNK_SIZE;

/// Errno-style status values used on the wire and in op results.
pub(crate) const EINVAL: i32 = 22;
pub(crate) const ETIMEDOUT: i32 = 110;

/// File striping scheme, as reported by the meta-server.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize,
)]
pub enum StriperType {
    /// Plainly replicated file, no striping.
    #[default]
    None,

    /// Reed-Solomon striped file.
    Rs,
}

/// Summary info of a locally stored chunk.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ChunkInfo {
    pub file_id: FileId,
    pub chunk_id: ChunkId,
    pub chunk_version: ChunkVersion,
    pub chunk_size: i64,
}
