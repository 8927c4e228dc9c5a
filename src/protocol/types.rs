use crate::error::Fault;
use serde::{Deserialize, Serialize};

// --- Command names ---

pub const CMD_PING: &str = "ping";
pub const CMD_STATUS: &str = "status";
pub const CMD_DELETE: &str = "delete";
pub const CMD_RENAME: &str = "rename";
pub const CMD_CHECKSUM: &str = "checksum";
pub const CMD_LISTING: &str = "listing";
pub const CMD_TRANSFER_START: &str = "transfer_start";
pub const CMD_TRANSFER_ABORT: &str = "transfer_abort";
pub const CMD_INTEGRITY_CHECK: &str = "integrity_check";
pub const CMD_REMERGE: &str = "remerge";
pub const CMD_REMERGE_PAUSE: &str = "remerge_pause";
pub const CMD_REMERGE_RESUME: &str = "remerge_resume";
pub const CMD_CAPABILITY_CHECK: &str = "capability_check";

/// Event name for inventory batches streamed during remerge.
pub const EVENT_INVENTORY: &str = "inventory_batch";

/// Extension family every node must speak to be usable at all.
pub const EXT_BASIC: &str = "basic";
/// Extension family covering the transfer command group.
pub const EXT_TRANSFER: &str = "transfer";

/// One frame on the control channel. Preceded on the wire by a `u32`
/// big-endian length prefix.
///
/// The handshake (`Hello` → `Require` → `HandshakeAck`) must complete before
/// any `Command`/`Response`/`Event` traffic is permitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// First frame, node → master: claims a node name and advertises the
    /// extension families and capabilities the node supports.
    Hello {
        name: String,
        extensions: Vec<String>,
        capabilities: Capabilities,
    },

    /// Master → node: the extension families the master requires. The node
    /// verifies it supports all of them and answers with `HandshakeAck`.
    Require { extensions: Vec<String> },

    /// Node → master: handshake verdict from the node's side.
    HandshakeAck { ok: bool, error: Option<String> },

    /// Master → node: one tagged command. `payload` encoding is
    /// command-specific; the transport routes only by `index` and `name`.
    Command {
        index: u32,
        name: String,
        payload: Vec<u8>,
    },

    /// Node → master: resolves the pending call with the same index.
    Response {
        index: u32,
        result: Result<Vec<u8>, Fault>,
    },

    /// Node → master, unsolicited: traffic outside the correlation table
    /// (inventory batches while remerging).
    Event { name: String, payload: Vec<u8> },
}

/// Capability flags a node advertises at handshake time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether the node can encrypt its data channel.
    pub encrypted_channel: bool,
}

/// Transfer direction as seen from the fleet: `Upload` means the node
/// receives file bytes, `Download` means it serves them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

// --- Command payloads ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteArgs {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameArgs {
    pub from: String,
    pub to_dir: String,
    pub to_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumArgs {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumReply {
    /// Hex digest of the file contents.
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingArgs {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingReply {
    pub entries: Vec<ListingEntry>,
}

/// Capacity/health snapshot a node reports on every status poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskStatus {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub active_transfers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStartArgs {
    pub direction: Direction,
    pub path: String,
}

/// Where the data channel for an arranged transfer will be opened. The data
/// channel bytes themselves are outside this protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub addr: String,
    pub port: u16,
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferAbortArgs {
    /// Shared identifier namespace with `integrity_check` jobs.
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityCheckArgs {
    pub path: String,
    /// Job id the master may later pass to `transfer_abort` to interrupt
    /// a long scan.
    pub job_id: String,
    /// Expected `path → checksum` pairs to verify against.
    pub expected: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityCheckReply {
    pub checked: u64,
    pub corrupt: Vec<String>,
    pub aborted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemergeArgs {
    /// Root path (relative to the node's storage root) to walk.
    pub root: String,
    /// Upper bound on entries per inventory batch.
    pub batch_size: usize,
}

/// One file the node found during its inventory walk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryEntry {
    pub path: String,
    pub size: u64,
    pub modified_ms: u64,
    /// Present only when the checksum was cheap to produce.
    pub checksum: Option<String>,
}

/// Payload of an `EVENT_INVENTORY` event frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryBatch {
    pub entries: Vec<InventoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityReply {
    pub capabilities: Capabilities,
}

// --- Payload helpers ---

/// Encodes a command/response payload. Failure here means a bug in the
/// payload type, surfaced as an I/O fault rather than a panic.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, Fault> {
    bincode::serialize(value).map_err(|e| Fault::Io(format!("encode payload: {}", e)))
}

/// Decodes a command/response payload.
pub fn decode_payload<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, Fault> {
    bincode::deserialize(bytes).map_err(|e| Fault::Io(format!("decode payload: {}", e)))
}
