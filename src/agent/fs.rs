//! Node Filesystem Store
//!
//! Local file operations behind the command handlers: delete, rename,
//! checksum, listing, disk status, integrity scanning, the inventory walk
//! that feeds reconciliation, and the data-channel side of transfers.
//!
//! All paths arriving from the wire are virtual (rooted at "/"); they are
//! resolved under the node's storage root and anything trying to climb out
//! of it is rejected before touching the disk.

use crate::error::Fault;
use crate::protocol::types::{
    ConnectInfo, DiskStatus, Direction, IntegrityCheckArgs, IntegrityCheckReply, InventoryBatch,
    InventoryEntry, ListingEntry, TransferStartArgs,
};

use dashmap::DashMap;
use sha3::{Digest, Sha3_256};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

const COPY_BUF_BYTES: usize = 64 * 1024;

/// Storage root plus the mutable bookkeeping the handlers share: the
/// active-transfer count reported in status polls and the abort flags for
/// long-running jobs (integrity scans and transfers share one namespace).
pub struct NodeStore {
    root: PathBuf,
    capacity_bytes: u64,
    active_transfers: AtomicU32,
    jobs: DashMap<String, Arc<AtomicBool>>,
}

impl NodeStore {
    pub fn new(root: impl Into<PathBuf>, capacity_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            capacity_bytes,
            active_transfers: AtomicU32::new(0),
            jobs: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active_transfers(&self) -> u32 {
        self.active_transfers.load(Ordering::Acquire)
    }

    /// Maps a virtual path onto the storage root, rejecting parent-dir
    /// components so a crafted path cannot escape it.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf, Fault> {
        let mut resolved = self.root.clone();

        for component in Path::new(virtual_path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(Fault::Rejected(format!(
                        "path escapes storage root: {}",
                        virtual_path
                    )))
                }
            }
        }

        Ok(resolved)
    }

    pub async fn delete(&self, virtual_path: &str) -> Result<(), Fault> {
        let target = self.resolve(virtual_path)?;
        let meta = tokio::fs::metadata(&target).await.map_err(Fault::io)?;

        if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await.map_err(Fault::io)?;
        } else {
            tokio::fs::remove_file(&target).await.map_err(Fault::io)?;
        }

        tracing::debug!("Deleted {}", virtual_path);
        Ok(())
    }

    pub async fn rename(
        &self,
        from: &str,
        to_dir: &str,
        to_name: &str,
    ) -> Result<(), Fault> {
        let source = self.resolve(from)?;
        let dest_dir = self.resolve(to_dir)?;
        let dest = dest_dir.join(to_name);

        tokio::fs::create_dir_all(&dest_dir).await.map_err(Fault::io)?;
        tokio::fs::rename(&source, &dest).await.map_err(Fault::io)?;

        tracing::debug!("Renamed {} -> {}/{}", from, to_dir, to_name);
        Ok(())
    }

    /// Streams the file through SHA3-256 and returns the hex digest.
    pub async fn checksum(&self, virtual_path: &str) -> Result<String, Fault> {
        let target = self.resolve(virtual_path)?;
        let mut file = tokio::fs::File::open(&target).await.map_err(Fault::io)?;

        let mut hasher = Sha3_256::new();
        let mut buf = vec![0u8; COPY_BUF_BYTES];

        loop {
            let n = file.read(&mut buf).await.map_err(Fault::io)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hex_digest(hasher.finalize().as_slice()))
    }

    pub async fn listing(&self, virtual_path: &str) -> Result<Vec<ListingEntry>, Fault> {
        let target = self.resolve(virtual_path)?;
        let mut dir = tokio::fs::read_dir(&target).await.map_err(Fault::io)?;
        let mut entries = Vec::new();

        while let Some(item) = dir.next_entry().await.map_err(Fault::io)? {
            let meta = item.metadata().await.map_err(Fault::io)?;
            entries.push(ListingEntry {
                name: item.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                is_dir: meta.is_dir(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Free space is the configured capacity minus what the storage root
    /// currently holds, floored at zero if the root has outgrown it.
    pub async fn disk_status(&self) -> Result<DiskStatus, Fault> {
        let used = self.dir_usage(&self.root).await?;

        Ok(DiskStatus {
            total_bytes: self.capacity_bytes,
            free_bytes: self.capacity_bytes.saturating_sub(used),
            active_transfers: self.active_transfers(),
        })
    }

    async fn dir_usage(&self, root: &Path) -> Result<u64, Fault> {
        let mut total = 0u64;
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // Root may not exist yet on a fresh node.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Fault::io(e)),
            };

            while let Some(item) = entries.next_entry().await.map_err(Fault::io)? {
                let meta = item.metadata().await.map_err(Fault::io)?;
                if meta.is_dir() {
                    stack.push(item.path());
                } else {
                    total += meta.len();
                }
            }
        }

        Ok(total)
    }

    /// Registers an abort flag under a job id. Setting it stops the job at
    /// its next checkpoint. An abort that raced in ahead of the job itself
    /// finds the flag already present and still takes effect.
    pub fn register_job(&self, job_id: &str) -> Arc<AtomicBool> {
        self.jobs
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub fn finish_job(&self, job_id: &str) {
        self.jobs.remove(job_id);
    }

    /// Flags a running job for abort. Unknown ids are a fault so the master
    /// learns the job already finished.
    pub fn abort_job(&self, job_id: &str) -> Result<(), Fault> {
        match self.jobs.get(job_id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                tracing::info!("Job {} flagged for abort", job_id);
                Ok(())
            }
            None => Err(Fault::Rejected(format!("no such job: {}", job_id))),
        }
    }

    /// Verifies the given `path -> checksum` expectations under `path`,
    /// checking the abort flag between files.
    pub async fn integrity_check(
        &self,
        args: &IntegrityCheckArgs,
    ) -> Result<IntegrityCheckReply, Fault> {
        let abort = self.register_job(&args.job_id);
        let mut checked = 0u64;
        let mut corrupt = Vec::new();
        let mut aborted = false;

        for (path, expected) in &args.expected {
            if abort.load(Ordering::Acquire) {
                aborted = true;
                break;
            }

            match self.checksum(path).await {
                Ok(actual) if &actual == expected => {}
                Ok(_) => corrupt.push(path.clone()),
                // A file we cannot read counts as corrupt for the scan.
                Err(_) => corrupt.push(path.clone()),
            }
            checked += 1;
        }

        self.finish_job(&args.job_id);

        tracing::info!(
            "Integrity check {} done: {} checked, {} corrupt, aborted={}",
            args.job_id,
            checked,
            corrupt.len(),
            aborted
        );

        Ok(IntegrityCheckReply {
            checked,
            corrupt,
            aborted,
        })
    }

    /// Walks the storage subtree under `root` and emits inventory batches
    /// of at most `batch_size` entries. Honors the pause signal between
    /// batches and stops if the emit channel closes.
    pub async fn walk_inventory(
        &self,
        root: &str,
        batch_size: usize,
        mut paused: watch::Receiver<bool>,
        emit: mpsc::Sender<InventoryBatch>,
    ) -> Result<(), Fault> {
        let base = self.resolve(root)?;
        let batch_size = batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        let mut stack = vec![base];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Fault::io(e)),
            };

            while let Some(item) = entries.next_entry().await.map_err(Fault::io)? {
                let meta = item.metadata().await.map_err(Fault::io)?;
                if meta.is_dir() {
                    stack.push(item.path());
                    continue;
                }

                batch.push(inventory_entry(&self.root, &item.path(), meta.len(), &meta));

                if batch.len() >= batch_size {
                    self.emit_batch(&mut batch, &mut paused, &emit).await?;
                }
            }
        }

        if !batch.is_empty() {
            self.emit_batch(&mut batch, &mut paused, &emit).await?;
        }

        Ok(())
    }

    async fn emit_batch(
        &self,
        batch: &mut Vec<InventoryEntry>,
        paused: &mut watch::Receiver<bool>,
        emit: &mpsc::Sender<InventoryBatch>,
    ) -> Result<(), Fault> {
        // Block while the master has us paused.
        while *paused.borrow() {
            if paused.changed().await.is_err() {
                return Err(Fault::Reconciliation("pause channel closed".to_string()));
            }
        }

        let entries = std::mem::take(batch);
        emit.send(InventoryBatch { entries })
            .await
            .map_err(|_| Fault::Reconciliation("inventory consumer gone".to_string()))
    }

    /// Arranges one data transfer: binds an ephemeral listener, spawns the
    /// task that serves or receives the file bytes, and returns where the
    /// master's peer should connect.
    pub async fn transfer_start(
        self: &Arc<Self>,
        args: &TransferStartArgs,
    ) -> Result<ConnectInfo, Fault> {
        let target = self.resolve(&args.path)?;
        let listener = TcpListener::bind("0.0.0.0:0").await.map_err(Fault::io)?;
        let local = listener.local_addr().map_err(Fault::io)?;

        let transfer_id = Uuid::new_v4().to_string();
        let abort = self.register_job(&transfer_id);
        self.active_transfers.fetch_add(1, Ordering::AcqRel);

        let store = self.clone();
        let direction = args.direction;
        let id = transfer_id.clone();
        tokio::spawn(async move {
            if let Err(e) = run_transfer(listener, direction, &target, abort).await {
                tracing::warn!("Transfer {} failed: {}", id, e);
            }
            store.active_transfers.fetch_sub(1, Ordering::AcqRel);
            store.finish_job(&id);
        });

        Ok(ConnectInfo {
            addr: local.ip().to_string(),
            port: local.port(),
            transfer_id,
        })
    }
}

async fn run_transfer(
    listener: TcpListener,
    direction: Direction,
    target: &Path,
    abort: Arc<AtomicBool>,
) -> Result<(), Fault> {
    let (mut socket, peer) = listener.accept().await.map_err(Fault::io)?;
    tracing::debug!("Data channel opened from {}", peer);

    let mut buf = vec![0u8; COPY_BUF_BYTES];

    match direction {
        Direction::Download => {
            let mut file = tokio::fs::File::open(target).await.map_err(Fault::io)?;
            loop {
                if abort.load(Ordering::Acquire) {
                    return Err(Fault::Rejected("transfer aborted".to_string()));
                }
                let n = file.read(&mut buf).await.map_err(Fault::io)?;
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).await.map_err(Fault::io)?;
            }
        }
        Direction::Upload => {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(Fault::io)?;
            }
            let mut file = tokio::fs::File::create(target).await.map_err(Fault::io)?;
            loop {
                if abort.load(Ordering::Acquire) {
                    return Err(Fault::Rejected("transfer aborted".to_string()));
                }
                let n = socket.read(&mut buf).await.map_err(Fault::io)?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n]).await.map_err(Fault::io)?;
            }
            file.flush().await.map_err(Fault::io)?;
        }
    }

    Ok(())
}

fn inventory_entry(
    root: &Path,
    path: &Path,
    size: u64,
    meta: &std::fs::Metadata,
) -> InventoryEntry {
    let relative = path
        .strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");

    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    InventoryEntry {
        path: format!("/{}", relative),
        size,
        modified_ms,
        // Hashing every file during the walk would stall it; checksums are
        // fetched on demand with the checksum command instead.
        checksum: None,
    }
}

pub fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
