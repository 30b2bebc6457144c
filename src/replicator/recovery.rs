//! Recovery of a missing chunk from the surviving stripes of its RS block.
//!
//! Instead of a single peer, the data comes from a striped reader that
//! fans out to the chunk servers holding the other stripes and decodes
//! the missing data. The reader returns arbitrary-sized buffers; this
//! module splices them into checksum-block-aligned writes through a
//! carry-over tail, detects end of chunk, and drains the reader's
//! asynchronous close before letting go of the instance.

use std::fmt::Write as _;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use crate::chunk::{
    CHECKSUM_BLOCK_SIZE, CHUNK_HEADER_SIZE, CHUNK_SIZE, ETIMEDOUT,
};
use crate::reader::{ReadCompletion, ReaderEvent, RecoveryReader, RecoverySpec};
use crate::replicator::instance::ReplicationInstance;
use crate::replicator::{ReplicateChunkOp, ReplicatorCtx};

/// Peer label used in recovery log lines, where there is no single peer.
const PEER_NAME: &str = "none";

/// Size in bytes of one encoded bad-stripe record:
/// `i32 stripe_idx, i64 chunk_id, i64 chunk_version`, little-endian.
const BAD_STRIPE_RECORD_SIZE: usize = 4 + 8 + 8;

pub(crate) struct RsRecoverer {
    inst: ReplicationInstance,
    reader: Box<dyn RecoveryReader>,
    spec: RecoverySpec,

    /// Bytes received from the reader but not yet block-aligned enough to
    /// write; always shorter than a checksum block between rounds.
    read_tail: BytesMut,

    read_size: usize,
    next_request_id: u64,
    pending_close: bool,
}

impl RsRecoverer {
    pub(crate) fn new(
        op: ReplicateChunkOp,
        reader: Box<dyn RecoveryReader>,
        read_size: usize,
        ctx: Arc<ReplicatorCtx>,
    ) -> Self {
        let spec = RecoverySpec {
            file_id: op.file_id,
            path_name: op.path_name.clone(),
            file_size: op.file_size,
            striper_type: op.striper_type,
            stripe_size: op.stripe_size,
            num_stripes: op.num_stripes,
            num_recovery_stripes: op.num_recovery_stripes,
            skip_holes: true,
            chunk_offset: op.chunk_offset,
        };
        RsRecoverer {
            inst: ReplicationInstance::new(op, ctx),
            reader,
            spec,
            read_tail: BytesMut::new(),
            read_size,
            next_request_id: 0,
            pending_close: false,
        }
    }

    fn buffer_bytes_required(&self) -> i64 {
        // one buffer per surviving stripe plus the assembled output
        self.read_size as i64 * (self.spec.num_stripes as i64 + 1)
    }

    pub(crate) async fn run(mut self) {
        let buffer_bytes = CHUNK_HEADER_SIZE.max(self.buffer_bytes_required());
        if self.inst.register(PEER_NAME)
            && self.inst.admit_buffers(buffer_bytes, PEER_NAME).await
            && self.start().await
        {
            self.transfer().await;
        }
        self.inst.terminate(PEER_NAME).await;

        // join the reader's asynchronous close before dropping it
        if self.pending_close {
            while let Some(event) = self.reader.next_event().await {
                if matches!(event, ReaderEvent::Inactive) {
                    pf_debug!(self.inst.chunk_id;
                        "recovery: chunk reader closed");
                    break;
                }
            }
        }
        self.reader.shutdown();
    }

    /// Size discovery is synthetic for recovery: the chunk is assumed full
    /// until a short read reveals its real end, and reads run under the
    /// target version itself.
    async fn start(&mut self) -> bool {
        let status = self.reader.open(&self.spec);
        if status < 0 {
            pf_error!(self.inst.chunk_id;
                "recovery: reader open failed: status: {}", status);
            return false;
        }
        let target_version = self.inst.target_version;
        self.inst
            .start_chunk(CHUNK_SIZE, target_version, PEER_NAME)
            .await
    }

    async fn transfer(&mut self) {
        loop {
            if self.inst.is_canceled() {
                self.reader.shutdown();
                return;
            }
            if self.inst.offset >= self.inst.chunk_size {
                self.inst.done = self.inst.offset == self.inst.chunk_size;
                if self.inst.done {
                    pf_info!(self.inst.chunk_id;
                        "recovery: done position: {} size: {}",
                        self.inst.offset, self.inst.chunk_size);
                } else {
                    pf_error!(self.inst.chunk_id;
                        "recovery: failed position: {} size: {}",
                        self.inst.offset, self.inst.chunk_size);
                }
                return;
            }

            let completion = match self.read_round().await {
                Some(completion) => completion,
                None => return,
            };
            if !self.handle_completion(completion).await {
                return;
            }
        }
    }

    /// Issues one read and waits for its completion, racing cancellation.
    /// Returns `None` when the transfer must stop (already logged).
    async fn read_round(&mut self) -> Option<ReadCompletion> {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let read_offset = self.spec.chunk_offset
            + self.inst.offset
            + self.read_tail.len() as i64;
        let status =
            self.reader.submit_read(self.read_size, read_offset, request_id);
        if status != 0 {
            pf_error!(self.inst.chunk_id;
                "recovery: read submit failed: offset: {} status: {}",
                read_offset, status);
            return None;
        }

        let cancel = self.inst.cancel.clone();
        let event = tokio::select! {
            event = self.reader.next_event() => Some(event),
            () = cancel.canceled() => None,
        };
        let completion = match event {
            None => {
                // drop in-flight work; the canceled read surfaces the way
                // a timed-out completion would have
                self.reader.shutdown();
                pf_info!(self.inst.chunk_id;
                    "recovery: canceled with read in flight: status: {}",
                    -ETIMEDOUT);
                return None;
            }
            Some(Some(ReaderEvent::Read(completion))) => completion,
            Some(Some(ReaderEvent::Inactive)) | Some(None) => {
                pf_error!(self.inst.chunk_id;
                    "recovery: reader went away with read in flight");
                return None;
            }
        };
        // a completion that does not match the read we issued is a logic
        // error in the reader backend
        if completion.request_id != request_id
            || completion.offset != read_offset
            || (completion.status >= 0
                && completion.data.len() > self.read_size)
        {
            pf_error!(self.inst.chunk_id;
                "recovery: invalid read completion: request: {}/{} \
                offset: {}/{} size: {}",
                completion.request_id, request_id,
                completion.offset, read_offset, completion.data.len());
            return None;
        }
        Some(completion)
    }

    /// Folds one successful completion into aligned writes; false stops
    /// the transfer (failure already logged).
    async fn handle_completion(
        &mut self,
        completion: ReadCompletion,
    ) -> bool {
        if completion.status < 0 {
            if !completion.data.is_empty() {
                self.report_bad_stripes(&completion.data, completion.status);
            }
            pf_error!(self.inst.chunk_id;
                "recovery: read failed: offset: {} status: {}",
                completion.offset, completion.status);
            return false;
        }

        let data = completion.data;
        let end_of_chunk = data.len() < self.read_size
            || self.inst.offset + self.read_size as i64
                >= self.inst.chunk_size;
        if end_of_chunk {
            // adopt tail + buffer wholesale; the chunk ends right here
            let mut buf = std::mem::take(&mut self.read_tail);
            buf.extend_from_slice(&data);
            self.inst.chunk_size = self.inst.offset + buf.len() as i64;
            self.reader.close();
            if self.reader.is_active() {
                self.pending_close = true;
            }
            if buf.is_empty() {
                return true; // zero bytes recovered; loop decides done
            }
            return self.inst.write_aligned(buf.freeze()).await;
        }

        let total = self.read_tail.len() + data.len();
        let aligned = total / CHECKSUM_BLOCK_SIZE * CHECKSUM_BLOCK_SIZE;
        if aligned == 0 {
            // nothing writable yet, keep accumulating
            self.read_tail.extend_from_slice(&data);
            return true;
        }
        let from_tail = aligned.min(self.read_tail.len());
        let mut buf = self.read_tail.split_to(from_tail);
        let from_data = aligned - from_tail;
        buf.extend_from_slice(&data[..from_data]);
        self.read_tail.extend_from_slice(&data[from_data..]);
        debug_assert!(self.read_tail.len() < CHECKSUM_BLOCK_SIZE);
        self.inst.write_aligned(buf.freeze()).await
    }

    /// Decodes the bad-stripe records a failed read carries into the op's
    /// diagnostic string: "idx chunkId ver idx chunkId ver ...".
    fn report_bad_stripes(&mut self, data: &Bytes, status: i32) {
        let max_entries =
            (self.spec.num_stripes + self.spec.num_recovery_stripes) as usize;
        let mut buf = data.clone();
        let mut diag = String::new();
        let mut entries = 0;
        while buf.has_remaining() {
            if entries >= max_entries {
                pf_error!(self.inst.chunk_id;
                    "recovery: invalid number of bad stripes");
                return;
            }
            if buf.remaining() < BAD_STRIPE_RECORD_SIZE {
                pf_error!(self.inst.chunk_id;
                    "recovery: invalid bad stripe buffer size: {}",
                    buf.remaining());
                return;
            }
            let stripe_idx = buf.get_i32_le();
            let chunk_id = buf.get_i64_le();
            let chunk_version = buf.get_i64_le();
            if stripe_idx < 0 || stripe_idx as usize >= max_entries {
                pf_error!(self.inst.chunk_id;
                    "recovery: invalid bad stripe index: {}", stripe_idx);
                return;
            }
            if entries > 0 {
                diag.push(' ');
            }
            let _ = write!(diag, "{} {} {}", stripe_idx, chunk_id, chunk_version);
            entries += 1;
        }
        if entries > 0 {
            pf_error!(self.inst.chunk_id;
                "recovery: status: {} invalid stripes: {}", status, diag);
            if let Some(op) = self.inst.op.as_mut() {
                op.invalid_stripe_idx = diag;
            }
        }
    }
}
