use crate::error::Fault;
use crate::protocol::codec::{FrameReader, FrameWriter};
use crate::protocol::types::{decode_payload, Frame, InventoryBatch, EVENT_INVENTORY};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// Outcome of one issued command: the response payload, or a fault.
pub type CallOutcome = Result<Vec<u8>, Fault>;

/// Out-of-band traffic the reader loop hands to the owning registry.
#[derive(Debug)]
pub enum LinkEvent {
    /// An inventory batch streamed by a remerging node.
    Inventory(InventoryBatch),
    /// The connection is gone; the link has already drained its pending
    /// calls when this arrives.
    Disconnected { reason: String },
}

/// One live connection to a storage node.
///
/// The pending-call table and the correlation counter are private to this
/// link and protected by the link's own lock, so calls against unrelated
/// nodes never contend.
#[derive(Debug)]
pub struct NodeLink {
    peer: SocketAddr,
    writer: tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<CallOutcome>>>,
    next_index: AtomicU32,
    alive: AtomicBool,
}

/// Handle returned by [`NodeLink::issue`]: the correlation index plus the
/// single-resolution slot the reader loop will fill.
pub struct PendingReply {
    link: Arc<NodeLink>,
    index: u32,
    rx: oneshot::Receiver<CallOutcome>,
}

impl PendingReply {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Blocks the calling task until the matching response arrives, the node
    /// disconnects, or the deadline elapses — whichever comes first. On
    /// timeout the pending entry is removed, so a late response for this
    /// index is silently discarded by the reader loop.
    pub async fn wait(self, deadline: Duration) -> CallOutcome {
        let PendingReply { link, index, rx } = self;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without resolving: only possible if the link
            // was torn down between drain and send.
            Ok(Err(_)) => Err(Fault::NodeUnavailable("connection closed".to_string())),
            Err(_) => {
                link.forget(index);
                Err(Fault::Timeout)
            }
        }
    }
}

impl NodeLink {
    /// Splits an already-handshaken stream, spawns the reader loop, and
    /// returns the shared link handle.
    pub fn start(stream: TcpStream, events: mpsc::Sender<LinkEvent>) -> Arc<Self> {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("static addr"));
        let (read_half, write_half) = stream.into_split();

        let link = Arc::new(Self {
            peer,
            writer: tokio::sync::Mutex::new(FrameWriter::new(write_half)),
            pending: Mutex::new(HashMap::new()),
            next_index: AtomicU32::new(0),
            alive: AtomicBool::new(true),
        });

        let reader_link = link.clone();
        tokio::spawn(async move {
            reader_link.reader_loop(FrameReader::new(read_half), events).await;
        });

        link
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    /// Sends a tagged command and returns immediately with the reply handle.
    /// Does not wait for the node to answer.
    pub async fn issue(self: &Arc<Self>, name: &str, payload: Vec<u8>) -> Result<PendingReply, Fault> {
        if !self.is_alive() {
            return Err(Fault::NodeUnavailable("link closed".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let index = self.claim_index(tx);

        let frame = Frame::Command {
            index,
            name: name.to_string(),
            payload,
        };

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_frame(&frame).await {
            drop(writer);
            self.forget(index);
            self.shutdown(&format!("write failed: {}", e));
            return Err(Fault::NodeUnavailable(format!("write failed: {}", e)));
        }

        Ok(PendingReply {
            link: self.clone(),
            index,
            rx,
        })
    }

    /// Issue + wait in one step with the given deadline.
    pub async fn call(self: &Arc<Self>, name: &str, payload: Vec<u8>, deadline: Duration) -> CallOutcome {
        self.issue(name, payload).await?.wait(deadline).await
    }

    /// Allocates a correlation index unique among this link's currently
    /// pending calls. The counter wraps; any index still outstanding is
    /// skipped rather than reused.
    fn claim_index(&self, tx: oneshot::Sender<CallOutcome>) -> u32 {
        let mut pending = self.pending.lock().expect("pending lock");

        loop {
            let index = self.next_index.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&index) {
                pending.insert(index, tx);
                return index;
            }
        }
    }

    fn take_pending(&self, index: u32) -> Option<oneshot::Sender<CallOutcome>> {
        self.pending.lock().expect("pending lock").remove(&index)
    }

    /// Drops a pending entry without resolving it (deadline expiry).
    fn forget(&self, index: u32) {
        self.pending.lock().expect("pending lock").remove(&index);
    }

    /// Marks the link dead and resolves every still-pending call with an
    /// unavailable fault in a single lock-protected sweep.
    pub fn shutdown(&self, reason: &str) {
        if self.alive.swap(false, Ordering::AcqRel) {
            tracing::debug!("link to {} closed: {}", self.peer, reason);
        }

        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.drain().collect()
        };

        for (index, tx) in drained {
            tracing::trace!("draining pending call {} on {}", index, self.peer);
            let _ = tx.send(Err(Fault::NodeUnavailable(reason.to_string())));
        }
    }

    async fn reader_loop(
        self: Arc<Self>,
        mut reader: FrameReader<OwnedReadHalf>,
        events: mpsc::Sender<LinkEvent>,
    ) {
        loop {
            match reader.read_frame().await {
                Ok(Frame::Response { index, result }) => match self.take_pending(index) {
                    Some(tx) => {
                        // Receiver may already have timed out; that is fine.
                        let _ = tx.send(result);
                    }
                    None => {
                        tracing::debug!(
                            "discarding late response {} from {} (no pending call)",
                            index,
                            self.peer
                        );
                    }
                },

                Ok(Frame::Event { name, payload }) => {
                    if name == EVENT_INVENTORY {
                        match decode_payload::<InventoryBatch>(&payload) {
                            Ok(batch) => {
                                if events.send(LinkEvent::Inventory(batch)).await.is_err() {
                                    // Registry gone; nothing left to feed.
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("bad inventory batch from {}: {}", self.peer, e);
                            }
                        }
                    } else {
                        tracing::warn!("unknown event '{}' from {}", name, self.peer);
                    }
                }

                Ok(other) => {
                    tracing::warn!(
                        "unexpected frame from {} after handshake: {:?}",
                        self.peer,
                        other
                    );
                }

                Err(e) => {
                    let reason = format!("read failed: {}", e);
                    self.shutdown(&reason);
                    let _ = events.send(LinkEvent::Disconnected { reason }).await;
                    return;
                }
            }
        }

        self.shutdown("registry dropped");
    }
}
