//! Process-wide index of in-flight replications, keyed by chunk id.
//!
//! At most one replication may be in flight per chunk. A second request
//! for the same chunk supersedes the first: the incumbent is canceled and
//! the registry entry is replaced atomically. The superseded instance
//! discovers at termination that it no longer owns its entry and skips
//! the `replication_done()` notification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::chunk::ChunkId;

/// Cooperative cancellation flag shared between a replication task and the
/// registry. Canceling never preempts: the task observes the flag at its
/// next suspension point.
#[derive(Clone)]
pub(crate) struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        CancelToken {
            inner: Arc::new(CancelInner {
                canceled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub(crate) fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Resolves once the token is canceled; usable as a `select!` branch.
    pub(crate) async fn canceled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before re-checking the flag so a concurrent
            // cancel() cannot slip between the check and the await
            notified.as_mut().enable();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

/// What a replication instance leaves behind in the registry while it
/// runs.
pub(crate) struct Registration {
    pub(crate) seq: u64,
    pub(crate) cancel: CancelToken,
    pub(crate) peer_name: String,
    pub(crate) offset: Arc<AtomicI64>,
}

/// Outcome of registering an instance for its chunk.
pub(crate) enum RegisterOutcome {
    /// No other replication was in flight for this chunk.
    Fresh,

    /// An incumbent existed; it has been canceled and replaced.
    Superseded {
        prev_peer: String,
        prev_offset: i64,
        prev_was_canceled: bool,
    },

    /// The entry already belongs to this very instance; a logic error and
    /// the caller must terminate.
    SelfCollision,
}

struct RegistryInner {
    in_flight: HashMap<ChunkId, Registration>,
    count: i64,
    next_seq: u64,
}

pub(crate) struct ReplicationRegistry {
    inner: Mutex<RegistryInner>,
}

impl ReplicationRegistry {
    pub(crate) fn new() -> Self {
        ReplicationRegistry {
            inner: Mutex::new(RegistryInner {
                in_flight: HashMap::new(),
                count: 0,
                next_seq: 0,
            }),
        }
    }

    /// Hands out instance sequence numbers; each instance gets a unique
    /// one for the registry ownership checks.
    pub(crate) fn next_seq(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        inner.next_seq
    }

    pub(crate) fn register(
        &self,
        chunk_id: ChunkId,
        entry: Registration,
    ) -> RegisterOutcome {
        let mut inner = self.inner.lock().unwrap();
        match inner.in_flight.get(&chunk_id) {
            None => {
                inner.in_flight.insert(chunk_id, entry);
                inner.count += 1;
                RegisterOutcome::Fresh
            }
            Some(prev) if prev.seq == entry.seq => {
                RegisterOutcome::SelfCollision
            }
            Some(_) => {
                // replacement keeps the in-flight count unchanged
                let prev = inner.in_flight.insert(chunk_id, entry).unwrap();
                let prev_was_canceled = prev.cancel.is_canceled();
                prev.cancel.cancel();
                RegisterOutcome::Superseded {
                    prev_peer: prev.peer_name,
                    prev_offset: prev.offset.load(Ordering::Relaxed),
                    prev_was_canceled,
                }
            }
        }
    }

    /// Whether the chunk's entry still belongs to the given instance.
    pub(crate) fn owns(&self, chunk_id: ChunkId, seq: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .in_flight
            .get(&chunk_id)
            .map(|entry| entry.seq == seq)
            .unwrap_or(false)
    }

    /// Removes the instance's entry when it still owns it. A superseded
    /// instance leaves the successor's entry alone. Canceled owners do not
    /// decrement the in-flight count (`cancel_all()` already zeroed it).
    pub(crate) fn deregister(
        &self,
        chunk_id: ChunkId,
        seq: u64,
        canceled: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let owns = inner
            .in_flight
            .get(&chunk_id)
            .map(|entry| entry.seq == seq)
            .unwrap_or(false);
        if owns {
            inner.in_flight.remove(&chunk_id);
            if !canceled && inner.count > 0 {
                inner.count -= 1;
            }
        }
    }

    pub(crate) fn num_replications(&self) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_flight.is_empty() {
            inner.count = 0;
        }
        inner.count
    }

    pub(crate) fn cancel_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.in_flight.values() {
            entry.cancel.cancel();
        }
        inner.count = 0;
    }
}
