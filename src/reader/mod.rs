//! Seam to the striped reader used for RS chunk recovery, plus the shared
//! meta-server client service the reader backends talk through.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use async_trait::async_trait;

use crate::chunk::{FileId, StriperType};

/// Retry/timeout policy of the striped data reader.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReaderParams {
    pub max_retry_count: u32,
    pub time_between_retries_sec: u32,
    pub op_timeout_sec: u32,
    pub idle_timeout_sec: u32,
    pub max_chunk_read_size: usize,
    pub lease_retry_timeout_sec: u32,
    pub lease_wait_timeout_sec: u32,
}

/// Retry/timeout policy of the meta-server client behind the reader.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MetaClientParams {
    pub max_retry_count: u32,
    pub time_between_retries_sec: u32,
    pub op_timeout_sec: u32,
    pub idle_timeout_sec: u32,
    pub reset_connection_on_op_timeout: bool,
}

/// The RS file geometry a recovery reader is opened against.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RecoverySpec {
    pub file_id: FileId,
    pub path_name: String,
    pub file_size: i64,
    pub striper_type: StriperType,
    pub stripe_size: i32,
    pub num_stripes: i32,
    pub num_recovery_stripes: i32,

    /// Missing ranges of the file read back as zeroes instead of errors.
    pub skip_holes: bool,

    /// File offset of the chunk being recovered; a multiple of the chunk
    /// size.
    pub chunk_offset: i64,
}

/// One read completion delivered by the reader backend.
#[derive(Debug, Clone)]
pub struct ReadCompletion {
    /// Echo of the id passed to `submit_read()`.
    pub request_id: u64,

    /// 0 on success, negative errno on failure.
    pub status: i32,

    /// File offset the read was issued at.
    pub offset: i64,

    /// Recovered bytes on success (possibly shorter than requested at end
    /// of chunk). On failure, an encoded list of bad-stripe records
    /// `(i32 stripe_idx, i64 chunk_id, i64 chunk_version)`, little-endian,
    /// possibly empty.
    pub data: Bytes,
}

/// Events delivered by `RecoveryReader::next_event()`.
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    Read(ReadCompletion),

    /// The reader has gone quiescent after `close()`/`shutdown()`.
    Inactive,
}

/// A striped reader recovering one chunk from the surviving stripes of its
/// RS block. Reads are asynchronous: `submit_read()` enqueues, the matching
/// completion arrives through `next_event()`. Retries, lease acquisition,
/// and op timeouts happen inside the backend per `ReaderParams`; they
/// surface here only as failed completions.
#[async_trait]
pub trait RecoveryReader: Send {
    /// Opens the reader against the RS file. Returns 0 or a negative errno.
    fn open(&mut self, spec: &RecoverySpec) -> i32;

    /// Enqueues a read of `num_bytes` at file-relative `offset`. Returns 0
    /// on successful submission or a negative errno.
    fn submit_read(
        &mut self,
        num_bytes: usize,
        offset: i64,
        request_id: u64,
    ) -> i32;

    /// Waits for the next reader event; `None` once the backend is gone.
    async fn next_event(&mut self) -> Option<ReaderEvent>;

    /// Begins an orderly close. If the reader `is_active()` afterwards, an
    /// `Inactive` event follows once in-flight work drains.
    fn close(&mut self);

    fn is_active(&self) -> bool;

    /// Drops all in-flight work immediately. No further completions are
    /// delivered for reads submitted before the shutdown.
    fn shutdown(&mut self);
}

/// Builds recovery readers; supplied by the embedding server (the real
/// backend lives in the client library layer).
pub trait RecoveryReaderFactory: Send + Sync {
    fn make_reader(
        &self,
        meta_client: &Arc<MetaServerClient>,
        params: &ReaderParams,
        log_prefix: String,
    ) -> Box<dyn RecoveryReader>;
}

/// The process-wide meta-server client the recovery readers share. The
/// meta host is fixed at construction; the port follows the recovery ops,
/// since the meta-server names its port in each directive.
pub struct MetaServerClient {
    host: String,
    params: MetaClientParams,
    target_port: Mutex<i32>,
}

impl MetaServerClient {
    pub fn new(host: impl Into<String>, params: MetaClientParams) -> Arc<Self> {
        Arc::new(MetaServerClient {
            host: host.into(),
            params,
            target_port: Mutex::new(-1),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn params(&self) -> &MetaClientParams {
        &self.params
    }

    pub fn target_port(&self) -> i32 {
        *self.target_port.lock().unwrap()
    }

    /// Points the client at a (possibly new) meta-server port.
    pub fn set_target_port(&self, port: i32) {
        debug_assert!(port > 0);
        let mut target = self.target_port.lock().unwrap();
        if *target > 0 && *target != port {
            pf_info!(self.host;
                "meta server client port has changed from: {} to: {}",
                *target, port);
        }
        *target = port;
    }

    /// Stops the client; readers created afterwards must re-target first.
    pub fn stop(&self) {
        *self.target_port.lock().unwrap() = -1;
    }
}
