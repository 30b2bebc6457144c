//! State and helpers shared by both replication variants: registration,
//! buffer admission, the checksum-aligned write path, and termination.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::chunk::{
    Admission, BufferGrant, ChunkId, ChunkVersion, ChunkWrite, FileId,
    CHECKSUM_BLOCK_SIZE, CHUNK_SIZE,
};
use crate::replicator::registry::{CancelToken, RegisterOutcome, Registration};
use crate::replicator::{ReplicateChunkOp, ReplicatorCtx};

/// Per-op state common to peer replication and RS recovery. The owning
/// task drives it linearly; the registry reaches in only through the
/// cancel token.
pub(crate) struct ReplicationInstance {
    pub(crate) file_id: FileId,
    pub(crate) chunk_id: ChunkId,

    /// Version the meta-server wants committed.
    pub(crate) target_version: ChunkVersion,

    /// Version reads are issued under; the peer-reported version for
    /// replication, the target version for recovery.
    pub(crate) chunk_version: ChunkVersion,

    /// Learned at start; -1 until then.
    pub(crate) chunk_size: i64,

    /// Next logical byte to read/write.
    pub(crate) offset: i64,

    pub(crate) done: bool,

    pub(crate) op: Option<ReplicateChunkOp>,

    pub(crate) seq: u64,
    pub(crate) cancel: CancelToken,
    offset_gauge: Arc<AtomicI64>,
    /// Held for the instance's whole life; releases on drop.
    _buffer_grant: Option<BufferGrant>,

    pub(crate) ctx: Arc<ReplicatorCtx>,
}

impl ReplicationInstance {
    pub(crate) fn new(op: ReplicateChunkOp, ctx: Arc<ReplicatorCtx>) -> Self {
        ctx.counters.replicator_started();
        let seq = ctx.registry.next_seq();
        ReplicationInstance {
            file_id: op.file_id,
            chunk_id: op.chunk_id,
            target_version: op.chunk_version,
            chunk_version: op.chunk_version,
            chunk_size: -1,
            offset: 0,
            done: false,
            op: Some(op),
            seq,
            cancel: CancelToken::new(),
            offset_gauge: Arc::new(AtomicI64::new(0)),
            _buffer_grant: None,
            ctx,
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Enters the registry, superseding any in-flight replication of the
    /// same chunk. Returns false when the instance must terminate right
    /// away.
    pub(crate) fn register(&mut self, peer_name: &str) -> bool {
        let entry = Registration {
            seq: self.seq,
            cancel: self.cancel.clone(),
            peer_name: peer_name.to_string(),
            offset: self.offset_gauge.clone(),
        };
        match self.ctx.registry.register(self.chunk_id, entry) {
            RegisterOutcome::Fresh => true,
            RegisterOutcome::Superseded {
                prev_peer,
                prev_offset,
                prev_was_canceled,
            } => {
                pf_info!(self.chunk_id;
                    "replication: peer: {} offset: {} canceling:{} \
                    restarting from peer: {}",
                    prev_peer, prev_offset,
                    if prev_was_canceled { " already canceled?" } else { "" },
                    peer_name);
                true
            }
            RegisterOutcome::SelfCollision => {
                pf_error!(self.chunk_id;
                    "replication: in-flight instance restarted onto itself");
                false
            }
        }
    }

    /// Requests the instance's whole byte budget. Returns false on
    /// over-quota, revoked wait, or cancellation, in which case the
    /// instance must terminate without any IO side effects.
    pub(crate) async fn admit_buffers(
        &mut self,
        bytes: i64,
        peer_name: &str,
    ) -> bool {
        let buffers = &self.ctx.buffers;
        if buffers.is_over_quota(bytes) {
            pf_error!(self.chunk_id;
                "replication: peer: {} bytes: {} over quota: {}",
                peer_name, bytes, buffers.max_client_quota());
            return false;
        }
        match buffers.acquire(bytes) {
            Admission::Granted(grant) => {
                self._buffer_grant = Some(grant);
                true
            }
            Admission::Wait(wait) => {
                pf_info!(self.chunk_id;
                    "replication: peer: {} denied: {} waiting for buffers",
                    peer_name, bytes);
                let cancel = self.cancel.clone();
                let granted = tokio::select! {
                    grant = wait.granted() => grant,
                    () = cancel.canceled() => None,
                };
                match granted {
                    Some(grant) if !self.is_canceled() => {
                        pf_info!(self.chunk_id;
                            "replication: peer: {} granted: {}",
                            peer_name, grant.bytes());
                        self._buffer_grant = Some(grant);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    /// Records the discovered chunk size and source version, drops any
    /// stale local copy, and allocates the version-0 chunk file the data
    /// streams into.
    pub(crate) async fn start_chunk(
        &mut self,
        chunk_size: i64,
        source_version: ChunkVersion,
        peer_name: &str,
    ) -> bool {
        if !(0..=CHUNK_SIZE).contains(&chunk_size) {
            pf_info!(self.chunk_id;
                "replication: invalid chunk size: {}", chunk_size);
            return false;
        }
        self.chunk_size = chunk_size;
        self.chunk_version = source_version;

        // a replication request implicitly makes any previous copy stale
        if let Err(err) =
            self.ctx.chunk_manager.stale_chunk(self.chunk_id, true).await
        {
            pf_warn!(self.chunk_id;
                "replication: stale chunk cleanup: {}", err);
        }
        // version 0 marks the file never-used until commit bumps it
        if let Err(err) = self
            .ctx
            .chunk_manager
            .alloc_chunk(self.file_id, self.chunk_id, 0, true)
            .await
        {
            pf_error!(self.chunk_id;
                "replication: chunk allocation failed: {}", err);
            return false;
        }
        pf_info!(self.chunk_id;
            "replication: peer: {} starting: size: {}",
            peer_name, chunk_size);
        true
    }

    /// Writes a buffer of freshly read chunk data, split into a checksum
    /// block aligned write plus at most one short tail. The tail is only
    /// legal when this buffer reaches exactly `chunk_size`.
    pub(crate) async fn write_aligned(&mut self, mut data: Bytes) -> bool {
        debug_assert!(!data.is_empty());
        let block = CHECKSUM_BLOCK_SIZE;
        let num = data.len();
        let mut tail = Bytes::new();
        if num > block {
            let rem = num % block;
            if rem > 0 {
                if self.offset + num as i64 != self.chunk_size {
                    pf_error!(self.chunk_id;
                        "replication: misaligned {} byte write at {} \
                        before end of chunk {}",
                        num, self.offset, self.chunk_size);
                    return false;
                }
                tail = data.split_off(num - rem);
            }
        }
        if !self.write_block(data).await {
            return false;
        }
        if !tail.is_empty() {
            if self.is_canceled() {
                return false;
            }
            if !self.write_block(tail).await {
                return false;
            }
        }
        true
    }

    async fn write_block(&mut self, data: Bytes) -> bool {
        let num = data.len();
        let write = ChunkWrite {
            chunk_id: self.chunk_id,
            chunk_version: 0,
            offset: self.offset,
            data,
            from_replication: true,
        };
        match self.ctx.chunk_manager.write_chunk(write).await {
            Ok(written) if written == num => {
                self.offset += written as i64;
                self.offset_gauge.store(self.offset, Ordering::Relaxed);
                true
            }
            Ok(written) => {
                pf_error!(self.chunk_id;
                    "replication: short write: got: {} expected: {}",
                    written, num);
                false
            }
            Err(err) => {
                pf_error!(self.chunk_id;
                    "replication: write failed: error: {}", err);
                false
            }
        }
    }

    /// Commits on success, reports the final status on the op, notifies
    /// the chunk manager unless superseded, bumps the right counters, and
    /// submits the response. Runs exactly once per instance.
    pub(crate) async fn terminate(&mut self, peer_name: &str) {
        let canceled = self.is_canceled();
        let mut status: i32 = -1;
        if self.done && !canceled {
            pf_info!(self.chunk_id;
                "replication: peer: {} finished", peer_name);
            match self
                .ctx
                .chunk_manager
                .change_chunk_vers(self.chunk_id, self.target_version, true)
                .await
            {
                Ok(()) => status = 0,
                Err(err) => {
                    pf_error!(self.chunk_id;
                        "replication: version change failed: error: {}", err);
                }
            }
        }

        let mut op = match self.op.take() {
            Some(op) => op,
            None => return, // already terminated
        };
        op.status = if status >= 0 { 0 } else { -1 };
        if status < 0 {
            pf_error!(self.chunk_id;
                "replication: peer: {} {} status: {} {}",
                peer_name,
                if canceled { "canceled" } else { "failed" },
                status, op);
        } else {
            let chunk_size = self
                .ctx
                .chunk_manager
                .get_chunk_info(self.chunk_id)
                .await
                .map_or(-1, |info| info.chunk_size);
            pf_info!(self.chunk_id;
                "{} chunk size: {}", op, chunk_size);
        }

        // a superseded instance leaves the chunk to its successor
        let notify =
            !canceled || self.ctx.registry.owns(self.chunk_id, self.seq);
        if notify {
            self.ctx.chunk_manager.replication_done(self.chunk_id, status);
        }

        op.chunk_version = if !canceled && status >= 0 {
            self.target_version
        } else {
            -1
        };
        if op.status < 0 || canceled {
            self.ctx
                .counters
                .op_failed(op.location.is_valid(), canceled);
        }

        self.ctx.registry.deregister(self.chunk_id, self.seq, canceled);
        self.ctx.submit_response(op);
    }
}

impl Drop for ReplicationInstance {
    fn drop(&mut self) {
        // the buffer grant (if any) flows back to the pool here as well
        self.ctx.counters.replicator_finished();
    }
}
