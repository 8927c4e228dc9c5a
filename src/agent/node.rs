//! Agent connection loop.
//!
//! The agent dials the master, runs the `Hello` / `Require` / `HandshakeAck`
//! exchange, and then serves commands until the connection drops. Ordinary
//! commands are dispatched through the [`CommandRegistry`] on their own
//! tasks, so a slow checksum never blocks a ping. The remerge command group
//! is handled here instead of the registry because it needs the connection
//! writer (for inventory events) and the per-session pause signal.
//!
//! On any disconnect the agent backs off with jitter and redials.

use crate::agent::fs::NodeStore;
use crate::agent::registry::CommandRegistry;
use crate::error::Fault;
use crate::protocol::codec::{FrameReader, FrameWriter};
use crate::protocol::types::*;

use anyhow::Result;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name this node claims during handshake. Must match a configured
    /// node entry on the master.
    pub name: String,
    pub master_addr: String,
    pub root: PathBuf,
    pub capacity_bytes: u64,
    /// Extension families this build supports.
    pub extensions: Vec<String>,
    pub capabilities: Capabilities,
}

pub struct NodeAgent {
    config: AgentConfig,
    store: Arc<NodeStore>,
    registry: Arc<CommandRegistry>,
}

impl NodeAgent {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        let store = NodeStore::new(config.root.clone(), config.capacity_bytes);
        let registry = CommandRegistry::new();
        register_handlers(&registry, &store, &config);

        Arc::new(Self {
            config,
            store,
            registry,
        })
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    /// Dial-serve-redial forever. Only returns if the master address fails
    /// to parse at all, which is a configuration error.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut backoff = RECONNECT_BASE;

        loop {
            match self.session().await {
                Ok(()) => {
                    tracing::info!("Master connection closed, reconnecting");
                    backoff = RECONNECT_BASE;
                }
                Err(e) => {
                    tracing::warn!("Session against {} failed: {}", self.config.master_addr, e);
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                }
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
            tokio::time::sleep(backoff + jitter).await;
        }
    }

    /// One full connection: dial, handshake, serve until disconnect.
    pub async fn session(self: &Arc<Self>) -> Result<()> {
        let stream = TcpStream::connect(&self.config.master_addr).await?;
        tracing::info!(
            "Connected to master {} as '{}'",
            self.config.master_addr,
            self.config.name
        );

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        self.handshake(&mut reader, &mut writer).await?;

        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        self.serve(reader, writer).await
    }

    async fn handshake(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &mut FrameWriter<OwnedWriteHalf>,
    ) -> Result<()> {
        writer
            .write_frame(&Frame::Hello {
                name: self.config.name.clone(),
                extensions: self.config.extensions.clone(),
                capabilities: self.config.capabilities.clone(),
            })
            .await?;

        let required = match reader.read_frame().await? {
            Frame::Require { extensions } => extensions,
            other => anyhow::bail!("expected Require frame, got {:?}", other),
        };

        let missing: Vec<_> = required
            .iter()
            .filter(|ext| !self.config.extensions.contains(ext))
            .cloned()
            .collect();

        if missing.is_empty() {
            writer
                .write_frame(&Frame::HandshakeAck {
                    ok: true,
                    error: None,
                })
                .await?;
            tracing::info!("Handshake complete ({} extensions required)", required.len());
            Ok(())
        } else {
            let error = format!("missing required extensions: {}", missing.join(", "));
            writer
                .write_frame(&Frame::HandshakeAck {
                    ok: false,
                    error: Some(error.clone()),
                })
                .await?;
            anyhow::bail!(error)
        }
    }

    async fn serve(
        self: &Arc<Self>,
        mut reader: FrameReader<OwnedReadHalf>,
        writer: Arc<tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>>,
    ) -> Result<()> {
        // Per-session pause signal for the inventory walk.
        let (pause_tx, pause_rx) = watch::channel(false);

        loop {
            let frame = match reader.read_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("Control channel read ended: {}", e);
                    return Ok(());
                }
            };

            let (index, name, payload) = match frame {
                Frame::Command {
                    index,
                    name,
                    payload,
                } => (index, name, payload),
                other => {
                    tracing::warn!("Unexpected frame after handshake: {:?}", other);
                    continue;
                }
            };

            match name.as_str() {
                CMD_REMERGE => {
                    self.spawn_remerge(index, payload, writer.clone(), pause_rx.clone());
                }
                CMD_REMERGE_PAUSE => {
                    let _ = pause_tx.send(true);
                    tracing::info!("Inventory walk paused by master");
                    respond(&writer, index, Ok(Vec::new())).await;
                }
                CMD_REMERGE_RESUME => {
                    let _ = pause_tx.send(false);
                    tracing::info!("Inventory walk resumed by master");
                    respond(&writer, index, Ok(Vec::new())).await;
                }
                _ => {
                    let registry = self.registry.clone();
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        let result = registry.dispatch(&name, payload).await;
                        respond(&writer, index, result).await;
                    });
                }
            }
        }
    }

    /// Runs the inventory walk on its own task: every batch goes out as an
    /// event frame, and the remerge command itself is answered only once
    /// the walk has finished or failed.
    fn spawn_remerge(
        self: &Arc<Self>,
        index: u32,
        payload: Vec<u8>,
        writer: Arc<tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>>,
        paused: watch::Receiver<bool>,
    ) {
        let store = self.store.clone();

        tokio::spawn(async move {
            let args: RemergeArgs = match decode_payload(&payload) {
                Ok(args) => args,
                Err(fault) => {
                    respond(&writer, index, Err(fault)).await;
                    return;
                }
            };

            tracing::info!("Starting inventory walk of {}", args.root);

            let (tx, mut rx) = mpsc::channel::<InventoryBatch>(8);
            let walker = tokio::spawn(async move {
                store
                    .walk_inventory(&args.root, args.batch_size, paused, tx)
                    .await
            });

            let mut sent = 0usize;
            while let Some(batch) = rx.recv().await {
                sent += batch.entries.len();
                let event = match encode_payload(&batch) {
                    Ok(bytes) => Frame::Event {
                        name: EVENT_INVENTORY.to_string(),
                        payload: bytes,
                    },
                    Err(fault) => {
                        respond(&writer, index, Err(fault)).await;
                        return;
                    }
                };
                if writer.lock().await.write_frame(&event).await.is_err() {
                    // Connection gone; the session loop will notice too.
                    return;
                }
            }

            let result = match walker.await {
                Ok(Ok(())) => {
                    tracing::info!("Inventory walk complete, {} entries sent", sent);
                    Ok(Vec::new())
                }
                Ok(Err(fault)) => Err(fault),
                Err(e) => Err(Fault::Reconciliation(format!("walk task died: {}", e))),
            };

            respond(&writer, index, result).await;
        });
    }
}

async fn respond(
    writer: &Arc<tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>>,
    index: u32,
    result: Result<Vec<u8>, Fault>,
) {
    let frame = Frame::Response { index, result };
    if let Err(e) = writer.lock().await.write_frame(&frame).await {
        tracing::debug!("Failed to write response {}: {}", index, e);
    }
}

/// Wires every supported command to its implementation. This is the whole
/// command surface of a node; nothing is discovered dynamically.
fn register_handlers(registry: &Arc<CommandRegistry>, store: &Arc<NodeStore>, config: &AgentConfig) {
    registry.register(CMD_PING, |_payload| async { Ok(Vec::new()) });

    let s = store.clone();
    registry.register(CMD_STATUS, move |_payload| {
        let s = s.clone();
        async move { encode_payload(&s.disk_status().await?) }
    });

    let s = store.clone();
    registry.register(CMD_DELETE, move |payload| {
        let s = s.clone();
        async move {
            let args: DeleteArgs = decode_payload(&payload)?;
            s.delete(&args.path).await?;
            Ok(Vec::new())
        }
    });

    let s = store.clone();
    registry.register(CMD_RENAME, move |payload| {
        let s = s.clone();
        async move {
            let args: RenameArgs = decode_payload(&payload)?;
            s.rename(&args.from, &args.to_dir, &args.to_name).await?;
            Ok(Vec::new())
        }
    });

    let s = store.clone();
    registry.register(CMD_CHECKSUM, move |payload| {
        let s = s.clone();
        async move {
            let args: ChecksumArgs = decode_payload(&payload)?;
            let checksum = s.checksum(&args.path).await?;
            encode_payload(&ChecksumReply { checksum })
        }
    });

    let s = store.clone();
    registry.register(CMD_LISTING, move |payload| {
        let s = s.clone();
        async move {
            let args: ListingArgs = decode_payload(&payload)?;
            let entries = s.listing(&args.path).await?;
            encode_payload(&ListingReply { entries })
        }
    });

    let s = store.clone();
    registry.register(CMD_INTEGRITY_CHECK, move |payload| {
        let s = s.clone();
        async move {
            let args: IntegrityCheckArgs = decode_payload(&payload)?;
            encode_payload(&s.integrity_check(&args).await?)
        }
    });

    let s = store.clone();
    registry.register(CMD_TRANSFER_START, move |payload| {
        let s = s.clone();
        async move {
            let args: TransferStartArgs = decode_payload(&payload)?;
            encode_payload(&s.transfer_start(&args).await?)
        }
    });

    let s = store.clone();
    registry.register(CMD_TRANSFER_ABORT, move |payload| {
        let s = s.clone();
        async move {
            let args: TransferAbortArgs = decode_payload(&payload)?;
            s.abort_job(&args.transfer_id)?;
            Ok(Vec::new())
        }
    });

    let capabilities = config.capabilities.clone();
    registry.register(CMD_CAPABILITY_CHECK, move |_payload| {
        let capabilities = capabilities.clone();
        async move {
            encode_payload(&CapabilityReply { capabilities })
        }
    });
}
