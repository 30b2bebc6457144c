//! Chunk replication and recovery dispatch.
//!
//! A `ReplicateChunkOp` from the meta-server either names a source peer
//! (plain replication) or, with an invalid peer location, asks for RS
//! recovery of the chunk. The dispatcher validates the request, picks the
//! variant, and spawns the per-chunk state machine; the op comes back on
//! the response channel with its final status exactly once.

mod instance;
mod peer;
mod recovery;
mod registry;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;

use crate::chunk::{
    BufferManager, ChunkId, ChunkManager, ChunkVersion, FileId, StriperType,
    CHUNK_SIZE, DEFAULT_IO_BUFFER_SIZE, EINVAL, MAX_STRIPE_SIZE,
    MIN_STRIPE_SIZE, STRIPE_ALIGNMENT,
};
use crate::peer::{PeerSyncProvider, ServerLocation};
use crate::reader::{
    MetaClientParams, MetaServerClient, ReaderParams, RecoveryReaderFactory,
};
use crate::replicator::peer::PeerReplicator;
use crate::replicator::recovery::RsRecoverer;
use crate::replicator::registry::ReplicationRegistry;
use crate::utils::{align_up, rs_read_size, DriftError};

/// Replication directive from the meta-server. The core fills in `status`,
/// `chunk_version`, and possibly `invalid_stripe_idx` before submitting
/// the op back on the response channel.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct ReplicateChunkOp {
    /// Request sequence number assigned by the meta-server plumbing.
    pub seq: i64,

    pub file_id: FileId,
    pub chunk_id: ChunkId,

    /// Target version to commit; `-1` on the way back unless successful.
    pub chunk_version: ChunkVersion,

    /// Source peer; a valid location selects plain replication, an invalid
    /// one selects RS recovery (with `port` naming the meta-server port).
    pub location: ServerLocation,

    // RS geometry, used only for recovery:
    pub chunk_offset: i64,
    pub striper_type: StriperType,
    pub num_stripes: i32,
    pub num_recovery_stripes: i32,
    pub stripe_size: i32,
    pub file_size: i64,
    pub path_name: String,

    /// 0 on success, -1 on failure, -EINVAL on an invalid request.
    pub status: i32,

    /// On RS failure: space-separated `idx chunkId version` records of the
    /// stripes that could not be read.
    pub invalid_stripe_idx: String,
}

impl fmt::Display for ReplicateChunkOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "replicate: seq: {} file: {} chunk: {} version: {} peer: {}",
            self.seq, self.file_id, self.chunk_id, self.chunk_version,
            self.location
        )?;
        if !self.location.is_valid() {
            write!(
                f,
                " recovery: offset: {} stripes: {}+{} stripe size: {}",
                self.chunk_offset, self.num_stripes,
                self.num_recovery_stripes, self.stripe_size
            )?;
        }
        Ok(())
    }
}

/// Configuration parameters struct.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct ReplicatorConfig {
    /// Reuse pooled peer connections instead of dialing per op.
    pub use_connection_pool: bool,

    /// RS data reader retry/timeout policy.
    pub rs_max_retry_count: u32,
    pub rs_time_between_retries_sec: u32,
    pub rs_op_timeout_sec: u32,
    pub rs_idle_timeout_sec: u32,

    /// Per-read and per-chunk read size ceilings, both kept aligned to the
    /// checksum block size.
    pub rs_max_read_size: usize,
    pub rs_max_chunk_read_size: usize,

    /// Read lease acquisition policy.
    pub rs_lease_retry_timeout_sec: u32,
    pub rs_lease_wait_timeout_sec: u32,

    /// Meta-server client retry/timeout policy.
    pub meta_max_retry_count: u32,
    pub meta_time_between_retries_sec: u32,
    pub meta_op_timeout_sec: u32,
    pub meta_idle_timeout_sec: u32,
    pub meta_reset_connection_on_op_timeout: bool,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        ReplicatorConfig {
            use_connection_pool: false,
            rs_max_retry_count: 3,
            rs_time_between_retries_sec: 10,
            rs_op_timeout_sec: 30,
            rs_idle_timeout_sec: 5 * 30,
            rs_max_read_size: 1 << 20,
            rs_max_chunk_read_size: 1 << 20,
            rs_lease_retry_timeout_sec: 3,
            rs_lease_wait_timeout_sec: 30,
            meta_max_retry_count: 2,
            meta_time_between_retries_sec: 10,
            meta_op_timeout_sec: 4 * 60,
            meta_idle_timeout_sec: 5 * 60,
            meta_reset_connection_on_op_timeout: true,
        }
    }
}

impl ReplicatorConfig {
    fn normalized(mut self) -> Self {
        let block = crate::chunk::CHECKSUM_BLOCK_SIZE as i64;
        self.rs_max_read_size =
            align_up(self.rs_max_read_size.max(1) as i64, block) as usize;
        self.rs_max_chunk_read_size =
            self.rs_max_chunk_read_size.max(self.rs_max_read_size);
        self
    }

    fn reader_params(&self) -> ReaderParams {
        ReaderParams {
            max_retry_count: self.rs_max_retry_count,
            time_between_retries_sec: self.rs_time_between_retries_sec,
            op_timeout_sec: self.rs_op_timeout_sec,
            idle_timeout_sec: self.rs_idle_timeout_sec,
            max_chunk_read_size: self.rs_max_chunk_read_size,
            lease_retry_timeout_sec: self.rs_lease_retry_timeout_sec,
            lease_wait_timeout_sec: self.rs_lease_wait_timeout_sec,
        }
    }

    fn meta_params(&self) -> MetaClientParams {
        MetaClientParams {
            max_retry_count: self.meta_max_retry_count,
            time_between_retries_sec: self.meta_time_between_retries_sec,
            op_timeout_sec: self.meta_op_timeout_sec,
            idle_timeout_sec: self.meta_idle_timeout_sec,
            reset_connection_on_op_timeout: self
                .meta_reset_connection_on_op_timeout,
        }
    }
}

/// Replication/recovery counters.
#[derive(Default)]
pub(crate) struct Counters {
    replicator_count: AtomicI64,
    replication_count: AtomicU64,
    recovery_count: AtomicU64,
    replication_error_count: AtomicU64,
    recovery_error_count: AtomicU64,
    replication_canceled_count: AtomicU64,
    recovery_canceled_count: AtomicU64,
}

impl Counters {
    pub(crate) fn replicator_started(&self) {
        self.replicator_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn replicator_finished(&self) {
        self.replicator_count.fetch_sub(1, Ordering::Relaxed);
    }

    fn replication_started(&self) {
        self.replication_count.fetch_add(1, Ordering::Relaxed);
    }

    fn recovery_started(&self) {
        self.recovery_count.fetch_add(1, Ordering::Relaxed);
    }

    fn replication_error(&self) {
        self.replication_error_count.fetch_add(1, Ordering::Relaxed);
    }

    fn recovery_error(&self) {
        self.recovery_error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Sorts a failed/canceled op into the right counter pair.
    pub(crate) fn op_failed(&self, is_replication: bool, canceled: bool) {
        match (is_replication, canceled) {
            (true, true) => {
                self.replication_canceled_count
                    .fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => self.replication_error(),
            (false, true) => {
                self.recovery_canceled_count.fetch_add(1, Ordering::Relaxed);
            }
            (false, false) => self.recovery_error(),
        }
    }

    fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            replicator_count: self.replicator_count.load(Ordering::Relaxed),
            replication_count: self.replication_count.load(Ordering::Relaxed),
            recovery_count: self.recovery_count.load(Ordering::Relaxed),
            replication_error_count: self
                .replication_error_count
                .load(Ordering::Relaxed),
            recovery_error_count: self
                .recovery_error_count
                .load(Ordering::Relaxed),
            replication_canceled_count: self
                .replication_canceled_count
                .load(Ordering::Relaxed),
            recovery_canceled_count: self
                .recovery_canceled_count
                .load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the replication counters.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct CountersSnapshot {
    /// Instances currently alive.
    pub replicator_count: i64,
    pub replication_count: u64,
    pub recovery_count: u64,
    pub replication_error_count: u64,
    pub recovery_error_count: u64,
    pub replication_canceled_count: u64,
    pub recovery_canceled_count: u64,
}

/// Shared services every replication instance runs against.
pub(crate) struct ReplicatorCtx {
    pub(crate) config: ReplicatorConfig,
    pub(crate) chunk_manager: Arc<dyn ChunkManager>,
    pub(crate) peers: Arc<dyn PeerSyncProvider>,
    pub(crate) reader_factory: Arc<dyn RecoveryReaderFactory>,
    pub(crate) buffers: Arc<BufferManager>,
    pub(crate) meta_client: Arc<MetaServerClient>,
    pub(crate) registry: ReplicationRegistry,
    pub(crate) counters: Counters,
    tx_resp: mpsc::UnboundedSender<ReplicateChunkOp>,
}

impl ReplicatorCtx {
    /// Hands the completed op back to the meta-server plumbing.
    pub(crate) fn submit_response(&self, op: ReplicateChunkOp) {
        if self.tx_resp.send(op).is_err() {
            pf_error!("replicator"; "response channel closed");
        }
    }
}

/// The replication/recovery dispatcher.
pub struct Replicator {
    ctx: Arc<ReplicatorCtx>,
}

impl Replicator {
    /// Creates the dispatcher from its collaborator services and an
    /// optional TOML config string. Returns the dispatcher and the
    /// receiver end of the op response channel.
    pub fn new_and_setup(
        config_str: Option<&str>,
        chunk_manager: Arc<dyn ChunkManager>,
        peers: Arc<dyn PeerSyncProvider>,
        reader_factory: Arc<dyn RecoveryReaderFactory>,
        buffers: Arc<BufferManager>,
        meta_host: &str,
    ) -> Result<
        (Self, mpsc::UnboundedReceiver<ReplicateChunkOp>),
        DriftError,
    > {
        let config = parsed_config!(config_str => ReplicatorConfig;
                                    use_connection_pool,
                                    rs_max_retry_count,
                                    rs_time_between_retries_sec,
                                    rs_op_timeout_sec,
                                    rs_idle_timeout_sec,
                                    rs_max_read_size,
                                    rs_max_chunk_read_size,
                                    rs_lease_retry_timeout_sec,
                                    rs_lease_wait_timeout_sec,
                                    meta_max_retry_count,
                                    meta_time_between_retries_sec,
                                    meta_op_timeout_sec,
                                    meta_idle_timeout_sec,
                                    meta_reset_connection_on_op_timeout)?
        .normalized();
        let meta_client =
            MetaServerClient::new(meta_host, config.meta_params());
        let (tx_resp, rx_resp) = mpsc::unbounded_channel();

        Ok((
            Replicator {
                ctx: Arc::new(ReplicatorCtx {
                    config,
                    chunk_manager,
                    peers,
                    reader_factory,
                    buffers,
                    meta_client,
                    registry: ReplicationRegistry::new(),
                    counters: Counters::default(),
                    tx_resp,
                }),
            },
            rx_resp,
        ))
    }

    /// Validates an op, selects the replication variant, and launches it.
    /// The op is answered on the response channel exactly once.
    pub async fn submit(&self, mut op: ReplicateChunkOp) {
        pf_debug!(op.chunk_id; "{}", op);
        let ctx = &self.ctx;
        if op.location.is_valid() {
            ctx.counters.replication_started();
            let peer = ctx
                .peers
                .get_peer(&op.location, ctx.config.use_connection_pool)
                .await;
            match peer {
                Ok(peer) => {
                    let replicator =
                        PeerReplicator::new(op, peer, ctx.clone());
                    tokio::spawn(replicator.run());
                }
                Err(err) => {
                    pf_error!(op.chunk_id;
                        "replication: unable to find peer: {} error: {} {}",
                        op.location, err, op);
                    op.status = -1;
                    ctx.counters.replication_error();
                    ctx.submit_response(op);
                }
            }
        } else {
            ctx.counters.recovery_started();
            if !valid_recovery_request(&op) {
                pf_error!(op.chunk_id; "replication: invalid request: {}", op);
                op.status = -EINVAL;
                ctx.counters.recovery_error();
                ctx.submit_response(op);
                return;
            }
            ctx.meta_client.set_target_port(op.location.port);
            let read_size = rs_read_size(
                ctx.config.rs_max_read_size,
                op.stripe_size as usize,
                ctx.buffers.max_client_quota(),
                op.num_stripes,
            );
            debug_assert!(read_size % DEFAULT_IO_BUFFER_SIZE == 0);
            let reader = ctx.reader_factory.make_reader(
                &ctx.meta_client,
                &ctx.config.reader_params(),
                format!("CR: {}", op.chunk_id),
            );
            let recoverer =
                RsRecoverer::new(op, reader, read_size, ctx.clone());
            tokio::spawn(recoverer.run());
        }
    }

    /// Number of replications currently in flight.
    pub fn num_replications(&self) -> i64 {
        self.ctx.registry.num_replications()
    }

    /// Cancels every in-flight replication and stops the shared
    /// meta-server client.
    pub fn cancel_all(&self) {
        self.ctx.registry.cancel_all();
        self.ctx.meta_client.stop();
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.ctx.counters.snapshot()
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.ctx.config
    }

    #[cfg(test)]
    pub(crate) fn meta_target_port(&self) -> i32 {
        self.ctx.meta_client.target_port()
    }

    #[cfg(test)]
    pub(crate) fn ctx(&self) -> Arc<ReplicatorCtx> {
        self.ctx.clone()
    }
}

/// RS geometry validation for recovery requests.
fn valid_recovery_request(op: &ReplicateChunkOp) -> bool {
    let stripe_size = op.stripe_size as i64;
    op.chunk_offset >= 0
        && op.chunk_offset % CHUNK_SIZE == 0
        && op.striper_type == StriperType::Rs
        && op.num_stripes > 0
        && op.num_recovery_stripes > 0
        && stripe_size >= MIN_STRIPE_SIZE
        && stripe_size <= MAX_STRIPE_SIZE
        && CHUNK_SIZE % stripe_size == 0
        && stripe_size % STRIPE_ALIGNMENT == 0
        && op.location.port > 0
}
