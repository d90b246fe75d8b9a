// SPDX-License-Identifier: Apache-2.0
//! Per-client proximity substream lifecycle.
//!
//! Each accepted connection is one client. The read half feeds a
//! partial-frame buffer and hands complete frames to the worker; the write
//! half is parked until the first outbound result "requests" the proximity
//! substream, at which point a writer task drains the client's outbound
//! FIFO. If acquisition finds no substream (the client raced a disconnect),
//! it retries with bounded backoff while queued sends accumulate, then
//! disables the stream and drops the queue.

use crate::worker::WorkerMsg;
use arbor_loc::ClientId;
use arbor_proto::wire;
use arbor_proto::Message;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const MAX_FRAME: usize = 8 * 1024 * 1024;
const ACQUIRE_RETRIES: u32 = 5;
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(100);

struct ClientSession {
    /// Write half parked at accept until the first outbound result.
    parked: Option<OwnedWriteHalf>,
    /// Sender into the writer task once the substream is up.
    substream: Option<tokio::sync::mpsc::UnboundedSender<Bytes>>,
    /// Outbound FIFO awaiting the substream.
    outstanding: VecDeque<Bytes>,
    /// An acquisition retry task is in flight.
    acquiring: bool,
    /// The stream was disabled; sends are dropped.
    closed: bool,
    /// The client's sequence-number bundle, owned here for its lifetime.
    seqnos: Arc<AtomicU64>,
}

/// Registry of live client sessions, owned by the main loop.
pub struct SessionRegistry {
    inner: Mutex<HashMap<ClientId, ClientSession>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        SessionRegistry {
            inner: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a fresh client, parking its write half and allocating its
    /// sequence-number bundle.
    pub async fn register(&self, write: OwnedWriteHalf) -> (ClientId, Arc<AtomicU64>) {
        let client = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let seqnos = Arc::new(AtomicU64::new(0));
        self.inner.lock().await.insert(
            client,
            ClientSession {
                parked: Some(write),
                substream: None,
                outstanding: VecDeque::new(),
                acquiring: false,
                closed: false,
                seqnos: seqnos.clone(),
            },
        );
        (client, seqnos)
    }

    /// Queues a blob for `client` and flushes if the substream is up. Never
    /// blocks on the network; unknown or closed clients drop the blob.
    pub async fn send(self: &Arc<Self>, client: ClientId, frame: Bytes) {
        let mut inner = self.inner.lock().await;
        let Some(sess) = inner.get_mut(&client) else {
            debug!(%client, "dropping result for an unknown client");
            return;
        };
        if sess.closed {
            return;
        }
        sess.outstanding.push_back(frame);
        if flush(sess, client) {
            return;
        }
        if !sess.acquiring {
            sess.acquiring = true;
            let registry = self.clone();
            tokio::spawn(async move {
                registry.retry_acquire(client).await;
            });
        }
    }

    /// Bounded-backoff acquisition retry. Gives up by disabling the stream
    /// and dropping whatever queued.
    async fn retry_acquire(self: Arc<Self>, client: ClientId) {
        for attempt in 0..ACQUIRE_RETRIES {
            tokio::time::sleep(ACQUIRE_BACKOFF * 2u32.pow(attempt)).await;
            let mut inner = self.inner.lock().await;
            let Some(sess) = inner.get_mut(&client) else {
                return;
            };
            if flush(sess, client) {
                sess.acquiring = false;
                return;
            }
        }
        let mut inner = self.inner.lock().await;
        if let Some(sess) = inner.get_mut(&client) {
            warn!(%client, queued = sess.outstanding.len(),
                "proximity substream acquisition failed; disabling stream");
            sess.closed = true;
            sess.acquiring = false;
            sess.outstanding.clear();
            sess.substream = None;
        }
    }

    /// Drops a client's session state; queued data goes with it.
    pub async fn on_close(&self, client: ClientId) {
        self.inner.lock().await.remove(&client);
    }

    /// Total frames queued behind unacquired substreams, for introspection.
    pub async fn queued_frames(&self) -> usize {
        self.inner
            .lock()
            .await
            .values()
            .map(|s| s.outstanding.len())
            .sum()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry::new()
    }
}

/// Tries to move the session's queue onto its writer task, acquiring the
/// substream from the parked write half if needed. Returns whether the
/// queue drained.
fn flush(sess: &mut ClientSession, client: ClientId) -> bool {
    if sess.substream.is_none() {
        if let Some(write) = sess.parked.take() {
            let (tx, rx) = unbounded_channel();
            sess.substream = Some(tx);
            tokio::spawn(write_loop(write, rx, client));
        }
    }
    let Some(tx) = sess.substream.clone() else {
        return false;
    };
    while let Some(frame) = sess.outstanding.pop_front() {
        if let Err(err) = tx.send(frame) {
            // Writer task died; requeue and let the retry path decide.
            sess.outstanding.push_front(err.0);
            sess.substream = None;
            return false;
        }
    }
    true
}

async fn write_loop(mut write: OwnedWriteHalf, mut rx: UnboundedReceiver<Bytes>, client: ClientId) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = write.write_all(&frame).await {
            warn!(%client, %err, "write failed on proximity substream");
            break;
        }
    }
}

/// Drives one client connection: reads frames, posts commands to the
/// worker, and tears the session down when the stream detaches.
pub async fn handle_client(
    stream: TcpStream,
    registry: Arc<SessionRegistry>,
    worker_tx: mpsc::Sender<WorkerMsg>,
) {
    let peer = stream.peer_addr().ok();
    let (mut read, write) = stream.into_split();
    let (client, seqnos) = registry.register(write).await;
    info!(%client, ?peer, "proximity session opened");

    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    let mut buf = vec![0u8; 16 * 1024];
    'conn: loop {
        let n = match read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(%client, %err, "read failed on proximity substream");
                break;
            }
        };
        acc.extend_from_slice(&buf[..n]);

        while let Some(frame_len) = wire::frame_length(&acc) {
            if frame_len > MAX_FRAME {
                warn!(%client, frame_len, "oversized frame; detaching stream");
                break 'conn;
            }
            if acc.len() < frame_len {
                break;
            }
            let frame: Vec<u8> = acc.drain(..frame_len).collect();
            match wire::decode_message(&frame) {
                Ok((Message::QueryRequest(req), _ts, _used)) => {
                    let _ = worker_tx.send(WorkerMsg::Command {
                        client,
                        params: req.query_parameters,
                        seqnos: seqnos.clone(),
                    });
                }
                Ok((Message::Results(_), _ts, _used)) => {
                    debug!(%client, "ignoring results frame sent by a client");
                }
                Err(err) => {
                    warn!(%client, %err, "undecodable frame; detaching stream");
                    break 'conn;
                }
            }
        }
    }

    registry.on_close(client).await;
    let _ = worker_tx.send(WorkerMsg::SessionEnded { client });
    info!(%client, "proximity session closed");
}
