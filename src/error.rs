//! Fault taxonomy shared by master and storage nodes.
//!
//! Every failure a caller can observe through the control channel is one of
//! these variants. Transport problems (lost connections, timeouts) are
//! resolved into fault values at the connection layer; callers never see raw
//! socket errors. Faults produced on a storage node are serialized into the
//! response frame, so the whole enum must stay wire-encodable.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// The node's connection is gone (never connected, dropped mid-call, or
    /// demoted after repeated poll failures). Pending calls are drained with
    /// this fault in a single sweep.
    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    /// No response arrived before the caller's deadline. Affects only the
    /// waiting call; the node keeps its current state.
    #[error("timed out waiting for response")]
    Timeout,

    /// The node has no handler registered under this command name. Indicates
    /// a protocol/version mismatch; never retried automatically.
    #[error("operation not supported: {0}")]
    OperationNotSupported(String),

    /// The selection scorecard was empty after all filters ran.
    #[error("no storage node available")]
    NoAvailableNode,

    /// Inventory reconciliation was aborted or produced an inconsistent
    /// batch. The node is held out of the available pool.
    #[error("reconciliation failed: {0}")]
    Reconciliation(String),

    /// An I/O error on the remote side, surfaced as a value.
    #[error("remote i/o error: {0}")]
    Io(String),

    /// Handshake or authorization rejection.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl Fault {
    /// Shorthand used by node-side handlers to wrap filesystem errors.
    pub fn io(err: std::io::Error) -> Self {
        Fault::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_roundtrip() {
        let fault = Fault::OperationNotSupported("zipscan".to_string());
        let bytes = bincode::serialize(&fault).unwrap();
        let back: Fault = bincode::deserialize(&bytes).unwrap();
        assert_eq!(fault, back);
    }

    #[test]
    fn test_fault_display() {
        let fault = Fault::NodeUnavailable("socket closed".to_string());
        assert!(fault.to_string().contains("socket closed"));
    }
}
