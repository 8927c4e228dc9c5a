//! Metadata-store collaborator interface.
//!
//! The hierarchical directory tree, permissions, and ownership live outside
//! this crate; the core only needs to ask where an inode's replicas are and
//! to push reconciliation results back. [`MetadataStore`] is that seam.
//! [`MemoryStore`] is the in-process implementation the daemon and tests use.

use crate::protocol::types::InventoryEntry;
use dashmap::DashMap;
use std::collections::HashSet;

/// What the store knows about one file path.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub size: u64,
    pub checksum: Option<String>,
}

pub trait MetadataStore: Send + Sync {
    /// Node names currently holding a live replica of `path`.
    fn inode_locations(&self, path: &str) -> Vec<String>;

    /// All paths the store believes are present on `node` (live replicas
    /// only, not ones already marked missing or corrupt).
    fn paths_on_node(&self, node: &str) -> Vec<String>;

    fn lookup(&self, path: &str) -> Option<FileMeta>;

    /// Records that `node` holds `path` with the inventoried size/checksum,
    /// creating the file entry if the store has never seen the path.
    fn record_replica(&self, path: &str, node: &str, entry: &InventoryEntry);

    /// Marks the replica on `node` absent.
    fn mark_missing(&self, path: &str, node: &str);

    /// Flags the replica on `node` as corrupt (size or checksum mismatch).
    fn mark_corrupt(&self, path: &str, node: &str);
}

#[derive(Debug, Default)]
struct FileRecord {
    size: u64,
    checksum: Option<String>,
    locations: HashSet<String>,
    missing: HashSet<String>,
    corrupt: HashSet<String>,
}

/// In-memory metadata store keyed by path.
#[derive(Default)]
pub struct MemoryStore {
    files: DashMap<String, FileRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a file entry directly; used by tests and bootstrap code.
    pub fn insert_file(&self, path: &str, size: u64, checksum: Option<&str>, nodes: &[&str]) {
        let record = FileRecord {
            size,
            checksum: checksum.map(|c| c.to_string()),
            locations: nodes.iter().map(|n| n.to_string()).collect(),
            missing: HashSet::new(),
            corrupt: HashSet::new(),
        };
        self.files.insert(path.to_string(), record);
    }

    pub fn is_missing_on(&self, path: &str, node: &str) -> bool {
        self.files
            .get(path)
            .map(|r| r.missing.contains(node))
            .unwrap_or(false)
    }

    pub fn is_corrupt_on(&self, path: &str, node: &str) -> bool {
        self.files
            .get(path)
            .map(|r| r.corrupt.contains(node))
            .unwrap_or(false)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

impl MetadataStore for MemoryStore {
    fn inode_locations(&self, path: &str) -> Vec<String> {
        self.files
            .get(path)
            .map(|r| r.locations.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn paths_on_node(&self, node: &str) -> Vec<String> {
        self.files
            .iter()
            .filter(|entry| entry.value().locations.contains(node))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn lookup(&self, path: &str) -> Option<FileMeta> {
        self.files.get(path).map(|r| FileMeta {
            size: r.size,
            checksum: r.checksum.clone(),
        })
    }

    fn record_replica(&self, path: &str, node: &str, entry: &InventoryEntry) {
        let mut record = self.files.entry(path.to_string()).or_insert_with(|| {
            FileRecord {
                size: entry.size,
                checksum: entry.checksum.clone(),
                ..FileRecord::default()
            }
        });

        // A checksum learned during inventory fills a gap left by an earlier
        // upload that skipped hashing.
        if record.checksum.is_none() {
            record.checksum = entry.checksum.clone();
        }

        record.locations.insert(node.to_string());
        record.missing.remove(node);
        record.corrupt.remove(node);
    }

    fn mark_missing(&self, path: &str, node: &str) {
        if let Some(mut record) = self.files.get_mut(path) {
            record.locations.remove(node);
            record.missing.insert(node.to_string());
        }
    }

    fn mark_corrupt(&self, path: &str, node: &str) {
        if let Some(mut record) = self.files.get_mut(path) {
            record.locations.remove(node);
            record.corrupt.insert(node.to_string());
        }
    }
}
