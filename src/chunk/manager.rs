//! Seam to the on-disk chunk store.

use bytes::Bytes;

use async_trait::async_trait;

use crate::chunk::{ChunkId, ChunkInfo, ChunkVersion, FileId};
use crate::utils::DriftError;

/// One checksum-block-aligned write of replicated chunk data. Only the
/// final write of a chunk may carry a misaligned (shorter) tail.
#[derive(Debug, Clone)]
pub struct ChunkWrite {
    pub chunk_id: ChunkId,

    /// Version the data is written under; always the never-used sentinel 0
    /// during replication, bumped by `change_chunk_vers()` at commit.
    pub chunk_version: ChunkVersion,

    /// Logical offset of this write within the chunk.
    pub offset: i64,

    pub data: Bytes,

    /// Set on all writes issued by the replication core; lets the store
    /// skip lease checks that only apply to client writes.
    pub from_replication: bool,
}

/// Interface to the chunk server's on-disk chunk store.
///
/// While a replication is in flight its chunk is not visible in the normal
/// chunk table; the chunk file exists with version 0 in the dirty
/// directory. Implementations must delete any version-0 chunk files found
/// on restart, which is what makes a crash mid-replication safe.
#[async_trait]
pub trait ChunkManager: Send + Sync {
    /// Marks any existing local copy of the chunk stale; with `delete_ok`
    /// the copy may be removed immediately.
    async fn stale_chunk(
        &self,
        chunk_id: ChunkId,
        delete_ok: bool,
    ) -> Result<(), DriftError>;

    /// Allocates a fresh chunk file for an incoming replication.
    async fn alloc_chunk(
        &self,
        file_id: FileId,
        chunk_id: ChunkId,
        chunk_version: ChunkVersion,
        is_replication: bool,
    ) -> Result<(), DriftError>;

    /// Writes one aligned block (or the final tail) of chunk data. Returns
    /// the number of bytes written.
    async fn write_chunk(&self, write: ChunkWrite)
        -> Result<usize, DriftError>;

    /// Commits the chunk at the given version, marking it stable and
    /// entering it into the chunk table.
    async fn change_chunk_vers(
        &self,
        chunk_id: ChunkId,
        chunk_version: ChunkVersion,
        stable: bool,
    ) -> Result<(), DriftError>;

    /// Looks up summary info of a locally stored chunk.
    async fn get_chunk_info(&self, chunk_id: ChunkId) -> Option<ChunkInfo>;

    /// Notifies the store that the replication of a chunk has finished
    /// (successfully or not) and its pending-replication bookkeeping can
    /// be dropped.
    fn replication_done(&self, chunk_id: ChunkId, status: i32);
}
