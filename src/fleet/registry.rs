//! Node registry and connection intake.
//!
//! Holds the one [`StorageNode`] handle per configured node, accepts
//! inbound node connections, runs the handshake, and drives each accepted
//! connection through queued-op replay and reconciliation before the node
//! is offered to the selection engine. Also owns the health poll loop
//! that parks silent nodes.

use crate::config::MasterConfig;
use crate::error::Fault;
use crate::fleet::node::{NodeState, StorageNode};
use crate::fleet::remerge::Reconciler;
use crate::metadata::MetadataStore;
use crate::protocol::codec::{FrameReader, FrameWriter};
use crate::protocol::mask::MaskSet;
use crate::protocol::types::{Capabilities, Frame};
use crate::transport::link::{LinkEvent, NodeLink};

use anyhow::Result;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A node that has not completed its handshake within this window is cut.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Consecutive poll failures before a node is parked `Unavailable`.
const POLL_STRIKES: u32 = 3;

/// Aggregate fleet snapshot for status logging. Byte and transfer sums
/// cover only nodes with a status snapshot on their current connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FleetStatus {
    pub total: usize,
    pub available: usize,
    pub remerging: usize,
    pub unavailable: usize,
    pub offline: usize,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub active_transfers: u32,
}

pub struct NodeRegistry {
    nodes: DashMap<String, Arc<StorageNode>>,
    metadata: Arc<dyn MetadataStore>,
    config: MasterConfig,
    /// One trigger per live connection; sending on it makes the owning
    /// connection task re-run reconciliation (operator-requested remerge).
    remerge_triggers: DashMap<String, mpsc::Sender<()>>,
}

impl NodeRegistry {
    /// Seeds one handle per configured node; every handle starts `Offline`.
    /// A bad mask pattern is a configuration error and fails startup.
    pub fn new(config: MasterConfig, metadata: Arc<dyn MetadataStore>) -> Result<Arc<Self>> {
        let nodes = DashMap::new();
        let call_timeout = Duration::from_secs(config.call_timeout_secs);

        for entry in &config.nodes {
            let masks = MaskSet::new(&entry.masks)?;
            nodes.insert(
                entry.name.clone(),
                StorageNode::new(&entry.name, masks, call_timeout),
            );
        }

        tracing::info!("Node registry seeded with {} node(s)", nodes.len());

        Ok(Arc::new(Self {
            nodes,
            metadata,
            config,
            remerge_triggers: DashMap::new(),
        }))
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<StorageNode>> {
        self.nodes.get(name).map(|entry| entry.value().clone())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes currently in service, in stable name order. Selection
    /// seeds its score card from this, so the order (and with it the
    /// tie-break) is deterministic across calls.
    pub fn list_available(&self) -> Vec<Arc<StorageNode>> {
        let mut nodes: Vec<_> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().is_available())
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    pub fn fleet_status(&self) -> FleetStatus {
        let mut status = FleetStatus {
            total: self.nodes.len(),
            ..FleetStatus::default()
        };

        for entry in self.nodes.iter() {
            let node = entry.value();
            match node.state() {
                NodeState::Available => status.available += 1,
                NodeState::Remerging => status.remerging += 1,
                NodeState::Unavailable => status.unavailable += 1,
                _ => status.offline += 1,
            }

            if let Some(disk) = node.last_status() {
                status.total_bytes += disk.total_bytes;
                status.free_bytes += disk.free_bytes;
                status.active_transfers += disk.active_transfers;
            }
        }

        status
    }

    /// Binds the configured listener, starts the poll loop, and serves
    /// inbound node connections forever.
    pub async fn listen(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!("Master listening on {}", self.config.listen_addr);

        tokio::spawn(self.clone().poll_loop());
        self.serve(listener).await
    }

    /// Accept loop, separated from [`listen`](Self::listen) so tests can
    /// drive it with an ephemeral listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let registry = self.clone();

            tokio::spawn(async move {
                if let Err(e) = registry.handle_connection(stream, peer).await {
                    tracing::warn!("Connection from {} rejected: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        tracing::debug!("Inbound connection from {}", peer);

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let hello = tokio::time::timeout(HANDSHAKE_DEADLINE, reader.read_frame())
            .await
            .map_err(|_| anyhow::anyhow!("no Hello within deadline"))??;
        let (node, extensions, capabilities) = self.authorize(hello, &peer)?;

        // The node is `Connecting` from here on; any exchange failure must
        // put it back to `Offline` or it can never redial.
        let exchange = tokio::time::timeout(
            HANDSHAKE_DEADLINE,
            self.extension_exchange(&node, &extensions, &mut reader, &mut writer),
        )
        .await;
        match exchange {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                node.set_state(NodeState::Offline);
                return Err(e);
            }
            Err(_) => {
                node.set_state(NodeState::Offline);
                anyhow::bail!("handshake with '{}' timed out", node.name());
            }
        }

        tracing::info!("Node '{}' handshake complete ({})", node.name(), peer);

        // Handshake complete; rejoin the halves and put the correlation
        // transport in charge of the socket.
        let stream = reader
            .into_inner()
            .reunite(writer.into_inner())
            .map_err(|e| anyhow::anyhow!("reunite failed: {}", e))?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let link = NodeLink::start(stream, events_tx);
        node.attach(link, capabilities);

        // Capacity 1: a remerge already pending makes further requests
        // redundant, so they are refused rather than queued.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        self.remerge_triggers
            .insert(node.name().to_string(), trigger_tx.clone());

        tokio::spawn(
            self.clone()
                .connection_events(node, events_rx, trigger_tx, trigger_rx),
        );
        Ok(())
    }

    /// Operator-requested remerge: demotes a node in service back to
    /// `Remerging` and re-runs reconciliation over its existing link.
    pub fn remerge(&self, name: &str) -> Result<(), Fault> {
        let node = self
            .by_name(name)
            .ok_or_else(|| Fault::Rejected(format!("unknown node '{}'", name)))?;

        let trigger = self
            .remerge_triggers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Fault::NodeUnavailable(format!("node '{}' not connected", name)))?;

        match trigger.try_send(()) {
            Ok(()) => {
                tracing::info!("Remerge of '{}' requested", node.name());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(())) => Err(Fault::Rejected(format!(
                "remerge of '{}' already pending",
                name
            ))),
            Err(mpsc::error::TrySendError::Closed(())) => Err(Fault::NodeUnavailable(format!(
                "node '{}' not connected",
                name
            ))),
        }
    }

    /// Verifies the Hello against the configured node table: the name must
    /// be known and the peer address must pass the node's masks.
    fn authorize(
        &self,
        hello: Frame,
        peer: &SocketAddr,
    ) -> Result<(Arc<StorageNode>, Vec<String>, Capabilities)> {
        let (name, extensions, capabilities) = match hello {
            Frame::Hello {
                name,
                extensions,
                capabilities,
            } => (name, extensions, capabilities),
            other => anyhow::bail!("expected Hello, got {:?}", other),
        };

        let node = self
            .by_name(&name)
            .ok_or_else(|| anyhow::anyhow!("unknown node '{}'", name))?;

        if !node.authorizes(&peer.ip()) {
            anyhow::bail!("address {} not authorized for node '{}'", peer, name);
        }

        if let Err(state) = node.begin_connecting() {
            anyhow::bail!("node '{}' already connected ({:?})", name, state);
        }

        Ok((node, extensions, capabilities))
    }

    /// The Require/Ack half of the handshake against an authorized node.
    async fn extension_exchange(
        &self,
        node: &Arc<StorageNode>,
        advertised: &[String],
        reader: &mut FrameReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &mut FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
    ) -> Result<()> {
        let missing: Vec<_> = self
            .config
            .required_extensions
            .iter()
            .filter(|ext| !advertised.contains(ext))
            .cloned()
            .collect();
        if !missing.is_empty() {
            anyhow::bail!(
                "node '{}' lacks required extension(s): {}",
                node.name(),
                missing.join(", ")
            );
        }

        node.set_state(NodeState::Handshaking);
        writer
            .write_frame(&Frame::Require {
                extensions: self.config.required_extensions.clone(),
            })
            .await?;

        match reader.read_frame().await? {
            Frame::HandshakeAck { ok: true, .. } => Ok(()),
            Frame::HandshakeAck { ok: false, error } => {
                anyhow::bail!(
                    "node '{}' refused handshake: {}",
                    node.name(),
                    error.unwrap_or_default()
                )
            }
            other => anyhow::bail!("expected HandshakeAck, got {:?}", other),
        }
    }

    /// Owns one connection after handshake: replays queued mutations, runs
    /// reconciliation, promotes the node, and then watches for disconnect
    /// or an operator remerge request. The trigger entry is removed when
    /// the connection ends, but only if a newer connection has not already
    /// replaced it.
    async fn connection_events(
        self: Arc<Self>,
        node: Arc<StorageNode>,
        mut events: mpsc::Receiver<LinkEvent>,
        trigger_tx: mpsc::Sender<()>,
        mut triggers: mpsc::Receiver<()>,
    ) {
        self.clone()
            .drive_connection(&node, &mut events, &mut triggers)
            .await;

        self.remerge_triggers
            .remove_if(node.name(), |_, tx| tx.same_channel(&trigger_tx));
    }

    async fn drive_connection(
        self: Arc<Self>,
        node: &Arc<StorageNode>,
        events: &mut mpsc::Receiver<LinkEvent>,
        triggers: &mut mpsc::Receiver<()>,
    ) {
        if let Err(fault) = node.replay_queued().await {
            tracing::warn!(
                "Queued-op replay on '{}' failed, dropping connection: {}",
                node.name(),
                fault
            );
            node.mark_unavailable("queued-op replay failed");
            node.detach("replay failed");
            return;
        }

        let reconciler = Reconciler::new(
            self.metadata.clone(),
            self.config.remerge_batch_size,
            self.config.remerge_pause_threshold,
            self.config.remerge_resume_threshold,
        );

        if !self.reconcile(&reconciler, node, events).await {
            return;
        }

        // Steady state: a disconnect ends the connection, a trigger runs
        // another reconciliation pass over the same link.
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(LinkEvent::Disconnected { reason }) => {
                        node.detach(&reason);
                        return;
                    }
                    Some(LinkEvent::Inventory(batch)) => {
                        tracing::warn!(
                            "Unsolicited inventory batch ({} entries) from '{}'",
                            batch.entries.len(),
                            node.name()
                        );
                    }
                    None => {
                        node.detach("event channel closed");
                        return;
                    }
                },
                Some(()) = triggers.recv() => {
                    tracing::info!("Re-running reconciliation of '{}' on request", node.name());
                    if !self.reconcile(&reconciler, node, events).await {
                        return;
                    }
                }
            }
        }
    }

    /// One reconciliation pass ending in promotion. Returns `false` when
    /// the pass failed and the connection must be dropped.
    async fn reconcile(
        &self,
        reconciler: &Reconciler,
        node: &Arc<StorageNode>,
        events: &mut mpsc::Receiver<LinkEvent>,
    ) -> bool {
        match reconciler.run(node, events).await {
            Ok(()) => {
                node.set_state(NodeState::Available);
                let status = self.fleet_status();
                tracing::info!(
                    "Node '{}' in service ({}/{} available)",
                    node.name(),
                    status.available,
                    status.total
                );
                true
            }
            Err(fault) => {
                tracing::warn!("Reconciliation of '{}' failed: {}", node.name(), fault);
                node.mark_unavailable("reconciliation failed");
                node.detach("reconciliation failed");
                false
            }
        }
    }

    /// Periodic health check: ping plus a status refresh for every node in
    /// service. Three consecutive failures park the node.
    pub async fn poll_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        let deadline = Duration::from_secs(self.config.poll_timeout_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            for entry in self.nodes.iter() {
                let node = entry.value().clone();
                if !node.is_available() {
                    continue;
                }

                tokio::spawn(async move {
                    let outcome = async {
                        node.ping(deadline).await?;
                        node.fetch_status(deadline).await
                    }
                    .await;

                    match outcome {
                        Ok(status) => {
                            node.reset_poll_failures();
                            tracing::debug!(
                                "Node '{}' healthy: {} bytes free, {} transfer(s)",
                                node.name(),
                                status.free_bytes,
                                status.active_transfers
                            );
                        }
                        Err(fault) => {
                            let strikes = node.record_poll_failure();
                            tracing::warn!(
                                "Poll of '{}' failed ({}/{}): {}",
                                node.name(),
                                strikes,
                                POLL_STRIKES,
                                fault
                            );
                            if strikes >= POLL_STRIKES {
                                node.mark_unavailable("unresponsive to polling");
                            }
                        }
                    }
                });
            }
        }
    }
}
