//! TCP peer connection stub speaking length-prefixed MessagePack frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use async_trait::async_trait;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{self, Duration};

use crate::chunk::{ChunkId, ChunkVersion};
use crate::peer::{PeerChunkMetadata, PeerSync, PeerSyncProvider, ServerLocation};
use crate::utils::DriftError;

/// Requests sent to a peer chunk server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub(crate) enum PeerRequest {
    GetChunkMetadata {
        seq: u64,
        chunk_id: ChunkId,
        read_verify: bool,
    },

    Read {
        seq: u64,
        chunk_id: ChunkId,
        chunk_version: ChunkVersion,
        offset: i64,
        num_bytes: usize,
    },
}

/// Replies received from a peer chunk server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub(crate) enum PeerReply {
    ChunkMetadata {
        seq: u64,
        status: i32,
        chunk_size: i64,
        chunk_version: ChunkVersion,
    },

    Read {
        seq: u64,
        status: i32,
        data: Vec<u8>,
    },
}

struct PeerConn {
    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,
}

impl PeerConn {
    /// Writes one `len || msgpack(req)` frame.
    async fn send_req(&mut self, req: &PeerRequest) -> Result<(), DriftError> {
        let req_bytes = encode_to_vec(req)?;
        self.conn_write.write_u64(req_bytes.len() as u64).await?;
        self.conn_write.write_all(&req_bytes).await?;
        self.conn_write.flush().await?;
        Ok(())
    }

    /// Reads one `len || msgpack(reply)` frame. Callers never cancel this
    /// mid-frame; a timed-out call marks the whole connection broken
    /// instead of resynchronizing.
    async fn recv_reply(&mut self) -> Result<PeerReply, DriftError> {
        let reply_len = self.conn_read.read_u64().await? as usize;
        let mut reply_buf = vec![0u8; reply_len];
        self.conn_read.read_exact(&mut reply_buf).await?;
        Ok(decode_from_slice(&reply_buf)?)
    }
}

/// A live TCP connection to one peer chunk server.
pub struct RemotePeer {
    location: ServerLocation,
    op_timeout: Duration,
    next_seq: AtomicU64,
    broken: AtomicBool,
    conn: AsyncMutex<PeerConn>,
}

impl RemotePeer {
    /// Dials the peer. The connection carries all ops of a replication
    /// sequentially, one request-reply pair at a time.
    pub async fn connect(
        location: ServerLocation,
        op_timeout: Duration,
    ) -> Result<Arc<Self>, DriftError> {
        let stream = TcpStream::connect((
            location.host.as_str(),
            location.port as u16,
        ))
        .await?;
        stream.set_nodelay(true)?;
        let (conn_read, conn_write) = stream.into_split();

        Ok(Arc::new(RemotePeer {
            location,
            op_timeout,
            // randomized initial sequence number, as clients do
            next_seq: AtomicU64::new(rand::random::<u32>() as u64),
            broken: AtomicBool::new(false),
            conn: AsyncMutex::new(PeerConn {
                conn_read,
                conn_write,
            }),
        }))
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn take_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::AcqRel)
    }

    async fn call(&self, req: PeerRequest) -> Result<PeerReply, DriftError> {
        if self.is_broken() {
            return logged_err!(self.location; "peer connection is broken");
        }
        let mut conn = self.conn.lock().await;
        let result = time::timeout(self.op_timeout, async {
            conn.send_req(&req).await?;
            conn.recv_reply().await
        })
        .await;
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                self.broken.store(true, Ordering::Release);
                Err(err)
            }
            Err(_) => {
                // a frame may be stuck half way in either direction
                self.broken.store(true, Ordering::Release);
                logged_err!(self.location; "peer op timed out")
            }
        }
    }
}

#[async_trait]
impl PeerSync for RemotePeer {
    fn location(&self) -> &ServerLocation {
        &self.location
    }

    async fn get_chunk_metadata(
        &self,
        chunk_id: ChunkId,
        read_verify: bool,
    ) -> Result<PeerChunkMetadata, DriftError> {
        let seq = self.take_seq();
        let reply = self
            .call(PeerRequest::GetChunkMetadata {
                seq,
                chunk_id,
                read_verify,
            })
            .await?;
        match reply {
            PeerReply::ChunkMetadata {
                seq: reply_seq,
                status,
                chunk_size,
                chunk_version,
            } if reply_seq == seq => {
                if status < 0 {
                    return logged_err!(self.location;
                        "chunk metadata error: chunk: {} status: {}",
                        chunk_id, status);
                }
                Ok(PeerChunkMetadata {
                    chunk_size,
                    chunk_version,
                })
            }
            reply => {
                self.broken.store(true, Ordering::Release);
                logged_err!(self.location;
                    "mismatched metadata reply: {:?}", reply)
            }
        }
    }

    async fn read(
        &self,
        chunk_id: ChunkId,
        chunk_version: ChunkVersion,
        offset: i64,
        num_bytes: usize,
    ) -> Result<Bytes, DriftError> {
        let seq = self.take_seq();
        let reply = self
            .call(PeerRequest::Read {
                seq,
                chunk_id,
                chunk_version,
                offset,
                num_bytes,
            })
            .await?;
        match reply {
            PeerReply::Read {
                seq: reply_seq,
                status,
                data,
            } if reply_seq == seq => {
                if status < 0 {
                    return logged_err!(self.location;
                        "peer read error: chunk: {} offset: {} status: {}",
                        chunk_id, offset, status);
                }
                Ok(Bytes::from(data))
            }
            reply => {
                self.broken.store(true, Ordering::Release);
                logged_err!(self.location;
                    "mismatched read reply: {:?}", reply)
            }
        }
    }
}

/// Default `PeerSyncProvider`: keeps one cached connection per location
/// when pooling is enabled, dials fresh otherwise. Broken connections are
/// evicted on the next lookup.
pub struct PeerPool {
    op_timeout: Duration,
    pool: Mutex<HashMap<String, Arc<RemotePeer>>>,
}

impl PeerPool {
    pub fn new(op_timeout: Duration) -> Arc<Self> {
        Arc::new(PeerPool {
            op_timeout,
            pool: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl PeerSyncProvider for PeerPool {
    async fn get_peer(
        &self,
        location: &ServerLocation,
        use_pool: bool,
    ) -> Result<Arc<dyn PeerSync>, DriftError> {
        if !use_pool {
            let peer =
                RemotePeer::connect(location.clone(), self.op_timeout).await?;
            return Ok(peer);
        }

        let key = location.to_string();
        {
            let mut pool = self.pool.lock().unwrap();
            let cached = pool.get(&key).cloned();
            if let Some(peer) = cached {
                if peer.is_broken() {
                    pool.remove(&key);
                } else {
                    return Ok(peer);
                }
            }
        }

        let peer =
            RemotePeer::connect(location.clone(), self.op_timeout).await?;
        self.pool
            .lock()
            .unwrap()
            .insert(key, peer.clone());
        Ok(peer)
    }
}
