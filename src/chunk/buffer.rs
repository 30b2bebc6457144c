//! Byte-budgeted buffer admission.
//!
//! The chunk server shares one pool of IO buffer bytes between client
//! requests, disk IO, and replications. A replication asks for its whole
//! byte budget up front and holds it until the instance is destroyed.
//! Grants are whole (never partial) and waiters are served in FIFO order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;

/// Outcome of an admission request.
pub enum Admission {
    /// Budget available right away; proceed.
    Granted(BufferGrant),

    /// Queued behind earlier waiters; the wait resolves to a whole grant.
    Wait(BufferWait),
}

struct Waiter {
    id: u64,
    bytes: i64,
    tx: oneshot::Sender<BufferGrant>,
}

struct Inner {
    bytes_in_use: i64,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
}

/// Shared buffer byte accounting for the whole process.
pub struct BufferManager {
    total_bytes: i64,
    max_client_quota: i64,
    // handle to self for minting grants from `&self` methods
    me: Weak<BufferManager>,
    inner: Mutex<Inner>,
}

impl BufferManager {
    pub fn new(total_bytes: i64, max_client_quota: i64) -> Arc<Self> {
        debug_assert!(total_bytes > 0 && max_client_quota > 0);
        Arc::new_cyclic(|me| BufferManager {
            total_bytes,
            max_client_quota,
            me: me.clone(),
            inner: Mutex::new(Inner {
                bytes_in_use: 0,
                next_waiter_id: 0,
                waiters: VecDeque::new(),
            }),
        })
    }

    fn handle(&self) -> Arc<BufferManager> {
        // grants and waits keep the manager alive, so this cannot fail
        self.me.upgrade().unwrap()
    }

    /// Whether a request of `bytes` exceeds the per-client quota. An
    /// over-quota request must not be queued at all.
    pub fn is_over_quota(&self, bytes: i64) -> bool {
        bytes > self.max_client_quota
    }

    pub fn max_client_quota(&self) -> i64 {
        self.max_client_quota
    }

    pub fn bytes_in_use(&self) -> i64 {
        self.inner.lock().unwrap().bytes_in_use
    }

    pub fn num_waiters(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }

    /// Requests `bytes` from the pool. Grants immediately when the pool has
    /// room and nobody is queued ahead; otherwise appends a FIFO waiter.
    pub fn acquire(&self, bytes: i64) -> Admission {
        debug_assert!(bytes > 0);
        let mut inner = self.inner.lock().unwrap();
        if inner.waiters.is_empty()
            && inner.bytes_in_use + bytes <= self.total_bytes
        {
            inner.bytes_in_use += bytes;
            return Admission::Granted(BufferGrant {
                mgr: self.handle(),
                bytes,
            });
        }

        let (tx, rx) = oneshot::channel();
        let id = inner.next_waiter_id;
        inner.next_waiter_id += 1;
        inner.waiters.push_back(Waiter { id, bytes, tx });
        Admission::Wait(BufferWait {
            mgr: self.handle(),
            id,
            rx,
        })
    }

    fn release(&self, bytes: i64) {
        let granted = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(inner.bytes_in_use >= bytes);
            inner.bytes_in_use -= bytes;
            self.pop_eligible(&mut inner)
        };
        Self::deliver(granted);
    }

    fn remove_waiter(&self, id: u64) {
        let granted = {
            let mut inner = self.inner.lock().unwrap();
            inner.waiters.retain(|w| w.id != id);
            // a waiter leaving the head can unblock the ones behind it
            self.pop_eligible(&mut inner)
        };
        Self::deliver(granted);
    }

    /// Pops queue-head waiters as long as their budgets fit, charging the
    /// pool for each. Must be called with the inner lock held.
    fn pop_eligible(
        &self,
        inner: &mut Inner,
    ) -> Vec<(oneshot::Sender<BufferGrant>, BufferGrant)> {
        let mut granted = Vec::new();
        while let Some(head) = inner.waiters.front() {
            if inner.bytes_in_use + head.bytes > self.total_bytes {
                break;
            }
            inner.bytes_in_use += head.bytes;
            let head = inner.waiters.pop_front().unwrap();
            granted.push((
                head.tx,
                BufferGrant {
                    mgr: self.handle(),
                    bytes: head.bytes,
                },
            ));
        }
        granted
    }

    /// Sends grants outside the lock. A receiver that has gone away simply
    /// drops its grant, which releases the bytes again.
    fn deliver(granted: Vec<(oneshot::Sender<BufferGrant>, BufferGrant)>) {
        for (tx, grant) in granted {
            let _ = tx.send(grant);
        }
    }
}

/// A held byte budget. Dropping the grant returns the bytes to the pool
/// and wakes eligible waiters in FIFO order.
pub struct BufferGrant {
    mgr: Arc<BufferManager>,
    bytes: i64,
}

impl BufferGrant {
    pub fn bytes(&self) -> i64 {
        self.bytes
    }
}

impl Drop for BufferGrant {
    fn drop(&mut self) {
        self.mgr.release(self.bytes);
    }
}

/// A queued admission request. Dropping the wait revokes it.
pub struct BufferWait {
    mgr: Arc<BufferManager>,
    id: u64,
    rx: oneshot::Receiver<BufferGrant>,
}

impl BufferWait {
    /// Resolves once the pool has granted the requested bytes. Returns
    /// `None` only if the manager was torn down underneath the waiter.
    pub async fn granted(mut self) -> Option<BufferGrant> {
        (&mut self.rx).await.ok()
        // dropping self here finds the waiter already dequeued
    }
}

impl Drop for BufferWait {
    fn drop(&mut self) {
        self.mgr.remove_waiter(self.id);
        // if a grant was already in flight on rx, dropping rx drops the
        // grant and the bytes flow back through BufferGrant::drop
    }
}
