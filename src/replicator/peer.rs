//! Replication of a whole chunk streamed from one peer chunk server.

use std::sync::Arc;

use crate::chunk::CHUNK_HEADER_SIZE;
use crate::peer::PeerSync;
use crate::replicator::instance::ReplicationInstance;
use crate::replicator::{ReplicateChunkOp, ReplicatorCtx};
use crate::utils::replication_read_size;

/// One in-flight chunk replication from a peer.
///
/// The flow is: learn the chunk size from the peer, then in a loop read N
/// bytes from the peer and write them to disk on checksum block
/// boundaries, and finally bump the chunk to its target version. While
/// streaming, the chunk is not in the chunk table; a crash leaves a
/// version-0 file that restart cleanup deletes.
pub(crate) struct PeerReplicator {
    inst: ReplicationInstance,
    peer: Arc<dyn PeerSync>,
    read_size: usize,
}

impl PeerReplicator {
    pub(crate) fn new(
        op: ReplicateChunkOp,
        peer: Arc<dyn PeerSync>,
        ctx: Arc<ReplicatorCtx>,
    ) -> Self {
        PeerReplicator {
            inst: ReplicationInstance::new(op, ctx),
            peer,
            read_size: replication_read_size(),
        }
    }

    pub(crate) async fn run(mut self) {
        let peer_name = self.peer.location().to_string();
        let buffer_bytes = CHUNK_HEADER_SIZE.max(self.read_size as i64);
        if self.inst.register(&peer_name)
            && self.inst.admit_buffers(buffer_bytes, &peer_name).await
            && self.start(&peer_name).await
        {
            self.transfer(&peer_name).await;
        }
        self.inst.terminate(&peer_name).await;
    }

    /// Size discovery: asks the peer for the chunk's metadata, adopts the
    /// peer-reported version for reads, and allocates the local file.
    async fn start(&mut self, peer_name: &str) -> bool {
        let meta = self
            .peer
            .get_chunk_metadata(self.inst.chunk_id, false)
            .await;
        if self.inst.is_canceled() {
            return false;
        }
        let meta = match meta {
            Ok(meta) => meta,
            Err(_) => return false, // already logged by the peer stub
        };
        self.inst
            .start_chunk(meta.chunk_size, meta.chunk_version, peer_name)
            .await
    }

    async fn transfer(&mut self, peer_name: &str) {
        loop {
            if self.inst.is_canceled() {
                return;
            }
            if self.inst.offset >= self.inst.chunk_size {
                self.inst.done = self.inst.offset == self.inst.chunk_size;
                if self.inst.done {
                    pf_info!(self.inst.chunk_id;
                        "replication: peer: {} done position: {} size: {}",
                        peer_name, self.inst.offset, self.inst.chunk_size);
                } else {
                    pf_error!(self.inst.chunk_id;
                        "replication: peer: {} failed position: {} size: {}",
                        peer_name, self.inst.offset, self.inst.chunk_size);
                }
                return;
            }

            let num_bytes = (self.inst.chunk_size - self.inst.offset)
                .min(self.read_size as i64)
                as usize;
            let data = self
                .peer
                .read(
                    self.inst.chunk_id,
                    self.inst.chunk_version,
                    self.inst.offset,
                    num_bytes,
                )
                .await;
            if self.inst.is_canceled() {
                return;
            }
            let data = match data {
                Ok(data) => data,
                Err(_) => return, // already logged by the peer stub
            };
            // a short read is only legal when it reaches end of chunk
            if data.len() > num_bytes
                || (data.len() < num_bytes
                    && (self.inst.offset + data.len() as i64)
                        < self.inst.chunk_size)
            {
                pf_error!(self.inst.chunk_id;
                    "replication: peer: {} short read: got: {} expected: {}",
                    peer_name, data.len(), num_bytes);
                return;
            }
            if !self.inst.write_aligned(data).await {
                return;
            }
        }
    }
}
