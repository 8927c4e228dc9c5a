//! Master-side node handle.
//!
//! One [`StorageNode`] exists per configured node for the whole life of
//! the master, whether or not the node is currently connected. The handle
//! owns the node's lifecycle state, the live link when there is one, the
//! last status snapshot, and the queue of mutations issued while the node
//! was unreachable.

use crate::error::Fault;
use crate::protocol::mask::MaskSet;
use crate::protocol::types::*;
use crate::transport::link::NodeLink;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not connected.
    Offline,
    /// TCP accepted, Hello not yet verified.
    Connecting,
    /// Hello received, extension exchange in progress.
    Handshaking,
    /// Inventory reconciliation running; excluded from selection.
    Remerging,
    /// Fully in service.
    Available,
    /// Parked after repeated poll failures; waits for a reconnect.
    Unavailable,
}

/// A mutation accepted while the node was unreachable, to be replayed in
/// order on the next connect before the node rejoins service.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedOp {
    Delete {
        path: String,
    },
    Rename {
        from: String,
        to_dir: String,
        to_name: String,
    },
}

#[derive(Debug)]
pub struct StorageNode {
    name: String,
    masks: MaskSet,
    call_timeout: Duration,
    state: RwLock<NodeState>,
    link: RwLock<Option<Arc<NodeLink>>>,
    capabilities: RwLock<Capabilities>,
    status: RwLock<Option<(DiskStatus, Instant)>>,
    poll_failures: AtomicU32,
    queued: Mutex<Vec<QueuedOp>>,
}

impl StorageNode {
    pub fn new(name: &str, masks: MaskSet, call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            masks,
            call_timeout,
            state: RwLock::new(NodeState::Offline),
            link: RwLock::new(None),
            capabilities: RwLock::new(Capabilities::default()),
            status: RwLock::new(None),
            poll_failures: AtomicU32::new(0),
            queued: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `addr` is allowed to connect as this node.
    pub fn authorizes(&self, addr: &IpAddr) -> bool {
        self.masks.allows(addr)
    }

    pub fn state(&self) -> NodeState {
        *self.state.read().expect("state lock")
    }

    pub fn set_state(&self, next: NodeState) {
        let mut state = self.state.write().expect("state lock");
        if *state != next {
            tracing::info!("Node '{}' {:?} -> {:?}", self.name, *state, next);
            *state = next;
        }
    }

    pub fn is_available(&self) -> bool {
        self.state() == NodeState::Available
    }

    /// Claims the handle for a new inbound connection. The check and the
    /// transition happen under one lock, so of two simultaneous
    /// connections claiming the same node name exactly one wins; the
    /// loser gets the state that beat it.
    pub fn begin_connecting(&self) -> Result<(), NodeState> {
        let mut state = self.state.write().expect("state lock");
        match *state {
            NodeState::Offline | NodeState::Unavailable => {
                tracing::info!(
                    "Node '{}' {:?} -> {:?}",
                    self.name,
                    *state,
                    NodeState::Connecting
                );
                *state = NodeState::Connecting;
                Ok(())
            }
            other => Err(other),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.read().expect("capabilities lock").clone()
    }

    /// Last status snapshot and its age, if the node has ever been polled
    /// on this connection.
    pub fn last_status(&self) -> Option<DiskStatus> {
        self.status
            .read()
            .expect("status lock")
            .as_ref()
            .map(|(s, _)| s.clone())
    }

    pub fn status_age(&self) -> Option<Duration> {
        self.status
            .read()
            .expect("status lock")
            .as_ref()
            .map(|(_, at)| at.elapsed())
    }

    pub fn link(&self) -> Option<Arc<NodeLink>> {
        self.link.read().expect("link lock").clone()
    }

    /// Binds a freshly handshaken link to this handle.
    pub fn attach(&self, link: Arc<NodeLink>, capabilities: Capabilities) {
        *self.capabilities.write().expect("capabilities lock") = capabilities;
        *self.link.write().expect("link lock") = Some(link);
        self.poll_failures.store(0, Ordering::Release);
    }

    /// Clears the link after a disconnect. A node parked `Unavailable`
    /// stays parked so the distinction survives until it redials.
    pub fn detach(&self, reason: &str) {
        tracing::info!("Node '{}' detached: {}", self.name, reason);
        *self.link.write().expect("link lock") = None;
        *self.status.write().expect("status lock") = None;

        if self.state() != NodeState::Unavailable {
            self.set_state(NodeState::Offline);
        }
    }

    pub fn record_poll_failure(&self) -> u32 {
        self.poll_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_poll_failures(&self) {
        self.poll_failures.store(0, Ordering::Release);
    }

    /// Parks the node and tears down its link; every pending call resolves
    /// with an unavailable fault.
    pub fn mark_unavailable(&self, reason: &str) {
        self.set_state(NodeState::Unavailable);
        if let Some(link) = self.link() {
            link.shutdown(reason);
        }
    }

    async fn call(&self, name: &str, payload: Vec<u8>) -> Result<Vec<u8>, Fault> {
        self.call_with(name, payload, self.call_timeout).await
    }

    async fn call_with(
        &self,
        name: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Vec<u8>, Fault> {
        let link = self
            .link()
            .ok_or_else(|| Fault::NodeUnavailable(format!("node '{}' not connected", self.name)))?;
        link.call(name, payload, deadline).await
    }

    // --- Typed command wrappers ---

    pub async fn ping(&self, deadline: Duration) -> Result<(), Fault> {
        self.call_with(CMD_PING, Vec::new(), deadline).await?;
        Ok(())
    }

    /// Polls the node for a fresh capacity snapshot and caches it.
    pub async fn fetch_status(&self, deadline: Duration) -> Result<DiskStatus, Fault> {
        let raw = self.call_with(CMD_STATUS, Vec::new(), deadline).await?;
        let status: DiskStatus = decode_payload(&raw)?;
        self.record_status(status.clone());
        Ok(status)
    }

    pub fn record_status(&self, status: DiskStatus) {
        *self.status.write().expect("status lock") = Some((status, Instant::now()));
    }

    pub async fn checksum(&self, path: &str) -> Result<String, Fault> {
        let raw = self
            .call(
                CMD_CHECKSUM,
                encode_payload(&ChecksumArgs {
                    path: path.to_string(),
                })?,
            )
            .await?;
        let reply: ChecksumReply = decode_payload(&raw)?;
        Ok(reply.checksum)
    }

    pub async fn listing(&self, path: &str) -> Result<Vec<ListingEntry>, Fault> {
        let raw = self
            .call(
                CMD_LISTING,
                encode_payload(&ListingArgs {
                    path: path.to_string(),
                })?,
            )
            .await?;
        let reply: ListingReply = decode_payload(&raw)?;
        Ok(reply.entries)
    }

    /// Deletes a path, or queues the delete for replay if the node is
    /// unreachable right now.
    pub async fn delete(&self, path: &str) -> Result<(), Fault> {
        let args = DeleteArgs {
            path: path.to_string(),
        };

        if self.link().is_none() {
            self.queue(QueuedOp::Delete {
                path: path.to_string(),
            });
            return Ok(());
        }

        self.call(CMD_DELETE, encode_payload(&args)?).await?;
        Ok(())
    }

    /// Renames a path, queueing for replay like [`delete`](Self::delete).
    pub async fn rename(&self, from: &str, to_dir: &str, to_name: &str) -> Result<(), Fault> {
        let args = RenameArgs {
            from: from.to_string(),
            to_dir: to_dir.to_string(),
            to_name: to_name.to_string(),
        };

        if self.link().is_none() {
            self.queue(QueuedOp::Rename {
                from: args.from,
                to_dir: args.to_dir,
                to_name: args.to_name,
            });
            return Ok(());
        }

        self.call(CMD_RENAME, encode_payload(&args)?).await?;
        Ok(())
    }

    pub async fn transfer_start(
        &self,
        direction: Direction,
        path: &str,
    ) -> Result<ConnectInfo, Fault> {
        let raw = self
            .call(
                CMD_TRANSFER_START,
                encode_payload(&TransferStartArgs {
                    direction,
                    path: path.to_string(),
                })?,
            )
            .await?;
        decode_payload(&raw)
    }

    pub async fn transfer_abort(&self, transfer_id: &str) -> Result<(), Fault> {
        self.call(
            CMD_TRANSFER_ABORT,
            encode_payload(&TransferAbortArgs {
                transfer_id: transfer_id.to_string(),
            })?,
        )
        .await?;
        Ok(())
    }

    pub async fn integrity_check(
        &self,
        args: &IntegrityCheckArgs,
    ) -> Result<IntegrityCheckReply, Fault> {
        let raw = self.call(CMD_INTEGRITY_CHECK, encode_payload(args)?).await?;
        decode_payload(&raw)
    }

    /// Re-queries the node's capabilities and caches the answer.
    pub async fn capability_check(&self) -> Result<Capabilities, Fault> {
        let raw = self.call(CMD_CAPABILITY_CHECK, Vec::new()).await?;
        let reply: CapabilityReply = decode_payload(&raw)?;
        *self.capabilities.write().expect("capabilities lock") = reply.capabilities.clone();
        Ok(reply.capabilities)
    }

    pub async fn remerge_pause(&self) -> Result<(), Fault> {
        self.call(CMD_REMERGE_PAUSE, Vec::new()).await?;
        Ok(())
    }

    pub async fn remerge_resume(&self) -> Result<(), Fault> {
        self.call(CMD_REMERGE_RESUME, Vec::new()).await?;
        Ok(())
    }

    // --- Offline queue ---

    fn queue(&self, op: QueuedOp) {
        tracing::debug!("Node '{}' offline, queueing {:?}", self.name, op);
        self.queued.lock().expect("queue lock").push(op);
    }

    pub fn queued_ops(&self) -> usize {
        self.queued.lock().expect("queue lock").len()
    }

    /// Replays every queued mutation in order. A failure leaves the
    /// remaining ops queued for the next attempt.
    pub async fn replay_queued(&self) -> Result<usize, Fault> {
        let ops: Vec<QueuedOp> = {
            let mut queued = self.queued.lock().expect("queue lock");
            queued.drain(..).collect()
        };

        let total = ops.len();
        for (i, op) in ops.iter().enumerate() {
            let outcome = match op {
                QueuedOp::Delete { path } => {
                    self.call(
                        CMD_DELETE,
                        encode_payload(&DeleteArgs { path: path.clone() })?,
                    )
                    .await
                }
                QueuedOp::Rename {
                    from,
                    to_dir,
                    to_name,
                } => {
                    self.call(
                        CMD_RENAME,
                        encode_payload(&RenameArgs {
                            from: from.clone(),
                            to_dir: to_dir.clone(),
                            to_name: to_name.clone(),
                        })?,
                    )
                    .await
                }
            };

            if let Err(fault) = outcome {
                let mut queued = self.queued.lock().expect("queue lock");
                let mut rest: Vec<QueuedOp> = ops[i..].to_vec();
                rest.extend(queued.drain(..));
                *queued = rest;
                return Err(fault);
            }
        }

        if total > 0 {
            tracing::info!("Replayed {} queued op(s) on node '{}'", total, self.name);
        }
        Ok(total)
    }
}
