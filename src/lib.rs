//! Chunk replication and recovery core of the DriftFS chunk server.
//!
//! The meta-server directs a chunk server either to replicate an existing
//! chunk by streaming it from a peer chunk server, or to recover a missing
//! chunk by reading the surviving stripes of its Reed-Solomon block through
//! a striped reader and writing the reconstructed data locally. This crate
//! owns the per-chunk replication state machines, the in-flight registry,
//! and buffer admission; the on-disk chunk store and the striped reader
//! backend are collaborator seams supplied by the embedding server.

#[macro_use]
mod utils;

mod chunk;
mod peer;
mod reader;
mod replicator;

pub use crate::utils::{
    align_down, align_up, gcd, lcm, replication_read_size, rs_read_size,
    DriftError,
};

pub use crate::chunk::{
    Admission, BufferGrant, BufferManager, BufferWait, ChunkId, ChunkInfo,
    ChunkManager, ChunkVersion, ChunkWrite, FileId, StriperType,
    CHECKSUM_BLOCK_SIZE, CHUNK_SIZE,
};

pub use crate::peer::{
    PeerChunkMetadata, PeerPool, PeerSync, PeerSyncProvider, RemotePeer,
    ServerLocation,
};

pub use crate::reader::{
    MetaClientParams, MetaServerClient, ReadCompletion, ReaderEvent,
    ReaderParams, RecoveryReader, RecoveryReaderFactory, RecoverySpec,
};

pub use crate::replicator::{
    CountersSnapshot, ReplicateChunkOp, Replicator, ReplicatorConfig,
};
