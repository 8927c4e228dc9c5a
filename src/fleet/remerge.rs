//! Inventory reconciliation.
//!
//! When a node finishes its handshake it does not rejoin service
//! immediately: the master first asks it to walk its storage root and
//! stream back what it actually holds, then reconciles that inventory
//! against the metadata store. Files the store never heard of are
//! recorded, files whose size or checksum disagree are flagged corrupt,
//! and files the store expected but the walk never mentioned are marked
//! missing. Only after all of that does the node become `Available`.
//!
//! ## Flow control
//!
//! Batches can arrive faster than they are applied. The driver counts
//! entries received but not yet applied; past the pause threshold it tells
//! the node to hold its walk, and once the backlog drains below the resume
//! threshold it lets it continue.

use crate::error::Fault;
use crate::fleet::node::{NodeState, StorageNode};
use crate::metadata::MetadataStore;
use crate::protocol::types::{encode_payload, InventoryBatch, InventoryEntry, RemergeArgs, CMD_REMERGE};
use crate::transport::link::LinkEvent;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Walks longer than this are treated as failed.
const REMERGE_DEADLINE: Duration = Duration::from_secs(3600);

/// Entry backlog bookkeeping for the pause/resume decisions. Pause fires
/// once when the backlog crosses the high mark; resume fires once when a
/// paused backlog drains under the low mark.
struct BacklogGauge {
    depth: AtomicUsize,
    paused: AtomicBool,
    pause_at: usize,
    resume_at: usize,
}

impl BacklogGauge {
    fn new(pause_at: usize, resume_at: usize) -> Self {
        Self {
            depth: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            pause_at,
            resume_at,
        }
    }

    /// Returns true when this addition is the one that should pause the node.
    fn add(&self, n: usize) -> bool {
        let depth = self.depth.fetch_add(n, Ordering::AcqRel) + n;
        depth >= self.pause_at && !self.paused.swap(true, Ordering::AcqRel)
    }

    /// Returns true when this drain is the one that should resume the node.
    fn sub(&self, n: usize) -> bool {
        let depth = self.depth.fetch_sub(n, Ordering::AcqRel).saturating_sub(n);
        depth <= self.resume_at
            && self
                .paused
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

pub struct Reconciler {
    metadata: Arc<dyn MetadataStore>,
    batch_size: usize,
    pause_threshold: usize,
    resume_threshold: usize,
}

impl Reconciler {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        batch_size: usize,
        pause_threshold: usize,
        resume_threshold: usize,
    ) -> Self {
        Self {
            metadata,
            batch_size,
            pause_threshold,
            resume_threshold,
        }
    }

    /// Runs a full reconciliation round against a freshly connected node.
    /// Consumes link events until the node's walk completes; on success the
    /// caller may promote the node to `Available`.
    pub async fn run(
        &self,
        node: &Arc<StorageNode>,
        events: &mut mpsc::Receiver<LinkEvent>,
    ) -> Result<(), Fault> {
        let link = node
            .link()
            .ok_or_else(|| Fault::NodeUnavailable(format!("node '{}' has no link", node.name())))?;

        node.set_state(NodeState::Remerging);
        tracing::info!("Reconciling inventory of node '{}'", node.name());

        let reply = link
            .issue(
                CMD_REMERGE,
                encode_payload(&RemergeArgs {
                    root: "/".to_string(),
                    batch_size: self.batch_size,
                })?,
            )
            .await?;
        let mut walk_done = tokio::spawn(reply.wait(REMERGE_DEADLINE));

        let gauge = Arc::new(BacklogGauge::new(
            self.pause_threshold,
            self.resume_threshold,
        ));
        let seen: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let (batch_tx, batch_rx) = mpsc::unbounded_channel::<InventoryBatch>();

        let applier = tokio::spawn(apply_loop(
            self.metadata.clone(),
            node.clone(),
            gauge.clone(),
            seen.clone(),
            batch_rx,
        ));

        let walk_result = loop {
            tokio::select! {
                outcome = &mut walk_done => {
                    break match outcome {
                        Ok(result) => result.map(|_| ()),
                        Err(e) => Err(Fault::Reconciliation(format!("walk await failed: {}", e))),
                    };
                }
                event = events.recv() => match event {
                    Some(LinkEvent::Inventory(batch)) => {
                        self.ingest(node, &gauge, &batch_tx, batch).await;
                    }
                    Some(LinkEvent::Disconnected { reason }) => {
                        drop(batch_tx);
                        let _ = applier.await;
                        return Err(Fault::NodeUnavailable(reason));
                    }
                    None => {
                        drop(batch_tx);
                        let _ = applier.await;
                        return Err(Fault::NodeUnavailable("event channel closed".to_string()));
                    }
                }
            }
        };

        // The walk reply can overtake event frames still sitting in the
        // channel; drain them before declaring the inventory complete.
        while let Ok(event) = events.try_recv() {
            if let LinkEvent::Inventory(batch) = event {
                self.ingest(node, &gauge, &batch_tx, batch).await;
            }
        }
        drop(batch_tx);
        applier
            .await
            .map_err(|e| Fault::Reconciliation(format!("apply task died: {}", e)))?;

        walk_result.map_err(|fault| {
            Fault::Reconciliation(format!("walk on '{}' failed: {}", node.name(), fault))
        })?;

        self.finish(node, &seen.lock().expect("seen lock"));
        Ok(())
    }

    async fn ingest(
        &self,
        node: &Arc<StorageNode>,
        gauge: &Arc<BacklogGauge>,
        batch_tx: &mpsc::UnboundedSender<InventoryBatch>,
        batch: InventoryBatch,
    ) {
        let n = batch.entries.len();
        if batch_tx.send(batch).is_err() {
            return;
        }

        if gauge.add(n) {
            tracing::info!(
                "Pausing walk on '{}' ({} entries backlogged)",
                node.name(),
                gauge.depth()
            );
            if let Err(fault) = node.remerge_pause().await {
                tracing::warn!("Failed to pause walk on '{}': {}", node.name(), fault);
            }
        }
    }

    /// Everything the store expected on the node but the walk never
    /// mentioned is gone.
    fn finish(&self, node: &Arc<StorageNode>, seen: &HashSet<String>) {
        let mut lost = 0;
        for path in self.metadata.paths_on_node(node.name()) {
            if !seen.contains(&path) {
                self.metadata.mark_missing(&path, node.name());
                lost += 1;
            }
        }

        tracing::info!(
            "Reconciliation of '{}' complete: {} present, {} missing",
            node.name(),
            seen.len(),
            lost
        );
    }
}

async fn apply_loop(
    metadata: Arc<dyn MetadataStore>,
    node: Arc<StorageNode>,
    gauge: Arc<BacklogGauge>,
    seen: Arc<Mutex<HashSet<String>>>,
    mut batch_rx: mpsc::UnboundedReceiver<InventoryBatch>,
) {
    while let Some(batch) = batch_rx.recv().await {
        let n = batch.entries.len();

        for entry in &batch.entries {
            apply_entry(metadata.as_ref(), node.name(), entry);
            seen.lock().expect("seen lock").insert(entry.path.clone());
        }

        if gauge.sub(n) {
            tracing::info!("Resuming walk on '{}'", node.name());
            if let Err(fault) = node.remerge_resume().await {
                tracing::warn!("Failed to resume walk on '{}': {}", node.name(), fault);
            }
        }
    }
}

/// One inventory entry against the store: unknown paths are recorded, a
/// size or checksum disagreement flags the replica corrupt, and a clean
/// match (re)confirms the replica.
fn apply_entry(metadata: &dyn MetadataStore, node: &str, entry: &InventoryEntry) {
    match metadata.lookup(&entry.path) {
        None => {
            metadata.record_replica(&entry.path, node, entry);
        }
        Some(meta) => {
            let size_mismatch = meta.size != entry.size;
            let checksum_mismatch = match (&meta.checksum, &entry.checksum) {
                (Some(expected), Some(actual)) => expected != actual,
                _ => false,
            };

            if size_mismatch || checksum_mismatch {
                tracing::warn!(
                    "Replica {} on '{}' disagrees with the store (size {} vs {})",
                    entry.path,
                    node,
                    entry.size,
                    meta.size
                );
                metadata.mark_corrupt(&entry.path, node);
            } else {
                metadata.record_replica(&entry.path, node, entry);
            }
        }
    }
}
