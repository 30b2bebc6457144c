//! Deterministic mock collaborators and a harness for replication tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};

use async_trait::async_trait;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::{self, Duration};

use crate::chunk::{
    Admission, BufferGrant, BufferManager, ChunkId, ChunkInfo, ChunkManager,
    ChunkVersion, ChunkWrite, FileId,
};
use crate::peer::{
    PeerChunkMetadata, PeerSync, PeerSyncProvider, ServerLocation,
};
use crate::reader::{
    MetaServerClient, ReadCompletion, ReaderEvent, ReaderParams,
    RecoveryReader, RecoveryReaderFactory, RecoverySpec,
};
use crate::replicator::{ReplicateChunkOp, Replicator, ReplicatorCtx};
use crate::utils::DriftError;

/// Repeating non-trivial byte pattern for data comparisons.
pub(crate) fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Extracts `(offset, len)` of every chunk write, in order.
pub(crate) fn write_events(events: &[MockEvent]) -> Vec<(i64, usize)> {
    events
        .iter()
        .filter_map(|event| match event {
            MockEvent::Write { offset, len } => Some((*offset, *len)),
            _ => None,
        })
        .collect()
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum MockEvent {
    Stale(ChunkId),
    Alloc(ChunkId, ChunkVersion),
    Write { offset: i64, len: usize },
    Commit(ChunkId, ChunkVersion),
    ReplicationDone(ChunkId, i32),
}

#[derive(Default)]
struct MockChunk {
    file_id: FileId,
    version: ChunkVersion,
    stable: bool,
    data: Vec<u8>,
}

#[derive(Default)]
struct MockStoreState {
    chunks: HashMap<ChunkId, MockChunk>,
    events: Vec<MockEvent>,
}

/// In-memory chunk store that records every call.
#[derive(Default)]
pub(crate) struct MockChunkManager {
    state: Mutex<MockStoreState>,
    fail_write_at: Mutex<Option<i64>>,
    fail_commit: AtomicBool,
}

impl MockChunkManager {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockChunkManager::default())
    }

    pub(crate) fn events(&self) -> Vec<MockEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub(crate) fn fail_write_at(&self, offset: i64) {
        *self.fail_write_at.lock().unwrap() = Some(offset);
    }

    pub(crate) fn fail_commit(&self) {
        self.fail_commit.store(true, Ordering::Release);
    }

    pub(crate) fn assert_chunk_data(
        &self,
        chunk_id: ChunkId,
        version: ChunkVersion,
        expected: &[u8],
    ) {
        let state = self.state.lock().unwrap();
        let chunk = state.chunks.get(&chunk_id).expect("chunk missing");
        assert!(chunk.stable, "chunk not committed");
        assert_eq!(chunk.version, version);
        assert_eq!(chunk.data, expected);
    }
}

#[async_trait]
impl ChunkManager for MockChunkManager {
    async fn stale_chunk(
        &self,
        chunk_id: ChunkId,
        _delete_ok: bool,
    ) -> Result<(), DriftError> {
        let mut state = self.state.lock().unwrap();
        state.chunks.remove(&chunk_id);
        state.events.push(MockEvent::Stale(chunk_id));
        Ok(())
    }

    async fn alloc_chunk(
        &self,
        file_id: FileId,
        chunk_id: ChunkId,
        chunk_version: ChunkVersion,
        is_replication: bool,
    ) -> Result<(), DriftError> {
        assert!(is_replication);
        let mut state = self.state.lock().unwrap();
        state.chunks.insert(
            chunk_id,
            MockChunk {
                file_id,
                version: chunk_version,
                stable: false,
                data: Vec::new(),
            },
        );
        state.events.push(MockEvent::Alloc(chunk_id, chunk_version));
        Ok(())
    }

    async fn write_chunk(
        &self,
        write: ChunkWrite,
    ) -> Result<usize, DriftError> {
        assert_eq!(write.chunk_version, 0);
        assert!(write.from_replication);
        if *self.fail_write_at.lock().unwrap() == Some(write.offset) {
            return Err(DriftError("injected write failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        let len = write.data.len();
        let chunk = state
            .chunks
            .get_mut(&write.chunk_id)
            .ok_or_else(|| DriftError("write to unallocated chunk".into()))?;
        assert_eq!(write.offset as usize, chunk.data.len());
        chunk.data.extend_from_slice(&write.data);
        state.events.push(MockEvent::Write {
            offset: write.offset,
            len,
        });
        Ok(len)
    }

    async fn change_chunk_vers(
        &self,
        chunk_id: ChunkId,
        chunk_version: ChunkVersion,
        stable: bool,
    ) -> Result<(), DriftError> {
        if self.fail_commit.load(Ordering::Acquire) {
            return Err(DriftError("injected commit failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        let chunk = state
            .chunks
            .get_mut(&chunk_id)
            .ok_or_else(|| DriftError("commit of unallocated chunk".into()))?;
        chunk.version = chunk_version;
        chunk.stable = stable;
        state.events.push(MockEvent::Commit(chunk_id, chunk_version));
        Ok(())
    }

    async fn get_chunk_info(&self, chunk_id: ChunkId) -> Option<ChunkInfo> {
        let state = self.state.lock().unwrap();
        state.chunks.get(&chunk_id).map(|chunk| ChunkInfo {
            file_id: chunk.file_id,
            chunk_id,
            chunk_version: chunk.version,
            chunk_size: chunk.data.len() as i64,
        })
    }

    fn replication_done(&self, chunk_id: ChunkId, status: i32) {
        self.state
            .lock()
            .unwrap()
            .events
            .push(MockEvent::ReplicationDone(chunk_id, status));
    }
}

/// Scripted peer serving a fixed byte range, with an optional gate that
/// blocks the first read until the test releases it.
pub(crate) struct MockPeer {
    location: ServerLocation,
    data: Vec<u8>,
    version: ChunkVersion,
    reported_size: AtomicI64,
    meta_calls: AtomicU64,
    read_calls: AtomicU64,
    gated: AtomicBool,
    entered: Semaphore,
    release: Semaphore,
}

impl MockPeer {
    pub(crate) fn new(data: Vec<u8>, version: ChunkVersion) -> Arc<Self> {
        let reported_size = data.len() as i64;
        Arc::new(MockPeer {
            location: ServerLocation::new("10.0.0.1", 30000),
            data,
            version,
            reported_size: AtomicI64::new(reported_size),
            meta_calls: AtomicU64::new(0),
            read_calls: AtomicU64::new(0),
            gated: AtomicBool::new(false),
            entered: Semaphore::new(0),
            release: Semaphore::new(0),
        })
    }

    pub(crate) fn set_reported_size(&self, size: i64) {
        self.reported_size.store(size, Ordering::Release);
    }

    pub(crate) fn num_metadata_calls(&self) -> u64 {
        self.meta_calls.load(Ordering::Acquire)
    }

    pub(crate) fn num_reads(&self) -> u64 {
        self.read_calls.load(Ordering::Acquire)
    }

    pub(crate) fn gate_first_read(&self) {
        self.gated.store(true, Ordering::Release);
    }

    pub(crate) async fn wait_read_entered(&self) {
        self.entered.acquire().await.unwrap().forget();
    }

    pub(crate) fn release_reads(&self) {
        self.release.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl PeerSync for MockPeer {
    fn location(&self) -> &ServerLocation {
        &self.location
    }

    async fn get_chunk_metadata(
        &self,
        _chunk_id: ChunkId,
        read_verify: bool,
    ) -> Result<PeerChunkMetadata, DriftError> {
        assert!(!read_verify);
        self.meta_calls.fetch_add(1, Ordering::AcqRel);
        Ok(PeerChunkMetadata {
            chunk_size: self.reported_size.load(Ordering::Acquire),
            chunk_version: self.version,
        })
    }

    async fn read(
        &self,
        _chunk_id: ChunkId,
        chunk_version: ChunkVersion,
        offset: i64,
        num_bytes: usize,
    ) -> Result<Bytes, DriftError> {
        assert_eq!(chunk_version, self.version);
        let first = self.read_calls.fetch_add(1, Ordering::AcqRel) == 0;
        if first && self.gated.load(Ordering::Acquire) {
            self.entered.add_permits(1);
            self.release.acquire().await.unwrap().forget();
        }
        let beg = (offset as usize).min(self.data.len());
        let end = self.data.len().min(beg + num_bytes);
        Ok(Bytes::copy_from_slice(&self.data[beg..end]))
    }
}

/// Hands out queued mock peers in submission order.
#[derive(Default)]
pub(crate) struct MockPeerProvider {
    queue: Mutex<VecDeque<Arc<MockPeer>>>,
}

impl MockPeerProvider {
    pub(crate) fn push(&self, peer: Arc<MockPeer>) {
        self.queue.lock().unwrap().push_back(peer);
    }
}

#[async_trait]
impl PeerSyncProvider for MockPeerProvider {
    async fn get_peer(
        &self,
        _location: &ServerLocation,
        _use_pool: bool,
    ) -> Result<Arc<dyn PeerSync>, DriftError> {
        match self.queue.lock().unwrap().pop_front() {
            Some(peer) => Ok(peer),
            None => Err(DriftError("no mock peer queued".into())),
        }
    }
}

/// One scripted reader response.
pub(crate) enum ReadStep {
    Data(Vec<u8>),
    Fail { status: i32, bad: Vec<(i32, i64, i64)> },
    Hang,
}

impl ReadStep {
    pub(crate) fn data(bytes: &[u8]) -> Self {
        ReadStep::Data(bytes.to_vec())
    }

    pub(crate) fn fail(status: i32, bad: &[(i32, i64, i64)]) -> Self {
        ReadStep::Fail {
            status,
            bad: bad.to_vec(),
        }
    }

    pub(crate) fn hang() -> Self {
        ReadStep::Hang
    }
}

/// Assertable state shared between a `MockReader` and its test.
pub(crate) struct MockReaderState {
    reads: Mutex<Vec<(usize, i64, u64)>>,
    opened: Mutex<Option<RecoverySpec>>,
    close_called: AtomicBool,
    shutdown_called: AtomicBool,
    read_submitted: Semaphore,
    shutdown_signal: Semaphore,
}

impl Default for MockReaderState {
    fn default() -> Self {
        MockReaderState {
            reads: Mutex::new(Vec::new()),
            opened: Mutex::new(None),
            close_called: AtomicBool::new(false),
            shutdown_called: AtomicBool::new(false),
            read_submitted: Semaphore::new(0),
            shutdown_signal: Semaphore::new(0),
        }
    }
}

impl MockReaderState {
    pub(crate) fn read_offsets(&self) -> Vec<i64> {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .map(|(_, offset, _)| *offset)
            .collect()
    }

    pub(crate) fn opened_spec(&self) -> Option<RecoverySpec> {
        self.opened.lock().unwrap().clone()
    }

    pub(crate) fn close_called(&self) -> bool {
        self.close_called.load(Ordering::Acquire)
    }

    pub(crate) async fn wait_read_submitted(&self) {
        self.read_submitted.acquire().await.unwrap().forget();
    }

    pub(crate) async fn wait_shutdown(&self) {
        self.shutdown_signal.acquire().await.unwrap().forget();
    }
}

/// Scripted recovery reader: each submitted read consumes the next step.
pub(crate) struct MockReader {
    state: Arc<MockReaderState>,
    steps: VecDeque<ReadStep>,
    open_status: i32,
    async_close: bool,
    active: bool,
    tx: mpsc::UnboundedSender<ReaderEvent>,
    rx: mpsc::UnboundedReceiver<ReaderEvent>,
}

impl MockReader {
    pub(crate) fn scripted(steps: Vec<ReadStep>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MockReader {
            state: Arc::new(MockReaderState::default()),
            steps: steps.into(),
            open_status: 0,
            async_close: false,
            active: false,
            tx,
            rx,
        }
    }

    /// Makes `close()` asynchronous: the reader stays active until it
    /// delivers an `Inactive` event.
    pub(crate) fn with_async_close(mut self) -> Self {
        self.async_close = true;
        self
    }

    pub(crate) fn with_open_status(mut self, status: i32) -> Self {
        self.open_status = status;
        self
    }

    pub(crate) fn state(&self) -> Arc<MockReaderState> {
        self.state.clone()
    }
}

#[async_trait]
impl RecoveryReader for MockReader {
    fn open(&mut self, spec: &RecoverySpec) -> i32 {
        *self.state.opened.lock().unwrap() = Some(spec.clone());
        if self.open_status == 0 {
            self.active = true;
        }
        self.open_status
    }

    fn submit_read(
        &mut self,
        num_bytes: usize,
        offset: i64,
        request_id: u64,
    ) -> i32 {
        self.state
            .reads
            .lock()
            .unwrap()
            .push((num_bytes, offset, request_id));
        self.state.read_submitted.add_permits(1);
        match self.steps.pop_front() {
            Some(ReadStep::Data(data)) => {
                let _ = self.tx.send(ReaderEvent::Read(ReadCompletion {
                    request_id,
                    status: 0,
                    offset,
                    data: Bytes::from(data),
                }));
            }
            Some(ReadStep::Fail { status, bad }) => {
                let mut buf = BytesMut::new();
                for (idx, chunk_id, version) in bad {
                    buf.put_i32_le(idx);
                    buf.put_i64_le(chunk_id);
                    buf.put_i64_le(version);
                }
                let _ = self.tx.send(ReaderEvent::Read(ReadCompletion {
                    request_id,
                    status,
                    offset,
                    data: buf.freeze(),
                }));
            }
            Some(ReadStep::Hang) | None => {}
        }
        0
    }

    async fn next_event(&mut self) -> Option<ReaderEvent> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        self.state.close_called.store(true, Ordering::Release);
        if self.async_close {
            let _ = self.tx.send(ReaderEvent::Inactive);
        } else {
            self.active = false;
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn shutdown(&mut self) {
        self.active = false;
        if !self.state.shutdown_called.swap(true, Ordering::AcqRel) {
            self.state.shutdown_signal.add_permits(1);
        }
    }
}

/// Hands out queued mock readers in submission order.
#[derive(Default)]
pub(crate) struct MockReaderFactory {
    readers: Mutex<VecDeque<MockReader>>,
}

impl MockReaderFactory {
    pub(crate) fn push(&self, reader: MockReader) {
        self.readers.lock().unwrap().push_back(reader);
    }
}

impl RecoveryReaderFactory for MockReaderFactory {
    fn make_reader(
        &self,
        _meta_client: &Arc<MetaServerClient>,
        _params: &ReaderParams,
        _log_prefix: String,
    ) -> Box<dyn RecoveryReader> {
        Box::new(
            self.readers
                .lock()
                .unwrap()
                .pop_front()
                .expect("no mock reader queued"),
        )
    }
}

/// A full dispatcher wired to mock collaborators.
pub(crate) struct Harness {
    pub(crate) replicator: Replicator,
    pub(crate) chunk_manager: Arc<MockChunkManager>,
    pub(crate) buffers: Arc<BufferManager>,
    pub(crate) peers: Arc<MockPeerProvider>,
    pub(crate) readers: Arc<MockReaderFactory>,
    rx_resp: mpsc::UnboundedReceiver<ReplicateChunkOp>,
}

impl Harness {
    pub(crate) fn new(config_str: Option<&str>) -> Result<Self, DriftError> {
        Self::with_buffers(config_str, 64 << 20, 16 << 20)
    }

    pub(crate) fn with_buffers(
        config_str: Option<&str>,
        total_bytes: i64,
        max_client_quota: i64,
    ) -> Result<Self, DriftError> {
        let chunk_manager = MockChunkManager::new();
        let buffers = BufferManager::new(total_bytes, max_client_quota);
        let peers = Arc::new(MockPeerProvider::default());
        let readers = Arc::new(MockReaderFactory::default());
        let (replicator, rx_resp) = Replicator::new_and_setup(
            config_str,
            chunk_manager.clone(),
            peers.clone(),
            readers.clone(),
            buffers.clone(),
            "meta.local",
        )?;
        Ok(Harness {
            replicator,
            chunk_manager,
            buffers,
            peers,
            readers,
            rx_resp,
        })
    }

    pub(crate) fn add_peer(
        &self,
        data: Vec<u8>,
        version: ChunkVersion,
    ) -> Arc<MockPeer> {
        let peer = MockPeer::new(data, version);
        self.peers.push(peer.clone());
        peer
    }

    pub(crate) fn add_reader(&self, reader: MockReader) {
        self.readers.push(reader);
    }

    pub(crate) async fn next_response(&mut self) -> ReplicateChunkOp {
        self.rx_resp.recv().await.expect("response channel closed")
    }

    /// Grabs pool bytes directly so a subsequent op has to wait.
    pub(crate) fn hold_buffers(&self, bytes: i64) -> BufferGrant {
        match self.buffers.acquire(bytes) {
            Admission::Granted(grant) => grant,
            Admission::Wait(_) => panic!("pool unexpectedly contended"),
        }
    }

    /// Spins until some op is queued on the buffer pool.
    pub(crate) async fn wait_for_buffer_waiters(&self) {
        for _ in 0..2000 {
            if self.buffers.num_waiters() > 0 {
                return;
            }
            time::sleep(Duration::from_millis(1)).await;
        }
        panic!("no buffer waiter showed up");
    }

    pub(crate) fn ctx(&self) -> Arc<ReplicatorCtx> {
        self.replicator.ctx()
    }
}
