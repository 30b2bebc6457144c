//! Seam to peer chunk servers, used by plain (same-chunk) replication.

mod remote;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use async_trait::async_trait;

use crate::chunk::{ChunkId, ChunkVersion};
use crate::utils::DriftError;

pub use remote::{PeerPool, RemotePeer};

/// Network location of a chunk server (or, for recovery requests, the
/// carrier of the target meta-server port with an empty host).
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ServerLocation {
    pub host: String,
    pub port: i32,
}

impl ServerLocation {
    pub fn new(host: impl Into<String>, port: i32) -> Self {
        ServerLocation {
            host: host.into(),
            port,
        }
    }

    /// A valid location selects plain replication; an invalid one selects
    /// RS recovery.
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port > 0
    }
}

impl Default for ServerLocation {
    fn default() -> Self {
        ServerLocation {
            host: String::new(),
            port: -1,
        }
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Chunk metadata as reported by the serving peer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PeerChunkMetadata {
    pub chunk_size: i64,
    pub chunk_version: ChunkVersion,
}

/// One peer chunk server connection. Requests of a single replication are
/// strictly sequential, so implementations only need to support one
/// outstanding op per caller.
#[async_trait]
pub trait PeerSync: Send + Sync {
    /// Location of the serving peer.
    fn location(&self) -> &ServerLocation;

    /// Fetches size and version of a chunk held by the peer.
    async fn get_chunk_metadata(
        &self,
        chunk_id: ChunkId,
        read_verify: bool,
    ) -> Result<PeerChunkMetadata, DriftError>;

    /// Reads chunk data from the peer. A returned buffer shorter than
    /// `num_bytes` is only legal when the read reaches end of chunk.
    async fn read(
        &self,
        chunk_id: ChunkId,
        chunk_version: ChunkVersion,
        offset: i64,
        num_bytes: usize,
    ) -> Result<Bytes, DriftError>;
}

/// Hands out peer connections to the dispatcher, either from a process
/// pool or by dialing a fresh connection per op.
#[async_trait]
pub trait PeerSyncProvider: Send + Sync {
    async fn get_peer(
        &self,
        location: &ServerLocation,
        use_pool: bool,
    ) -> Result<Arc<dyn PeerSync>, DriftError>;
}
