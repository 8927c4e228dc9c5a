//! Distributed File Fleet Library
//!
//! This library crate defines the core modules of the file-serving fleet:
//! one master coordinating many storage nodes over a single multiplexed
//! control channel each. It is the foundation for the binary executable
//! (`main.rs`), which can run as either side.
//!
//! ## Architecture Modules
//! The system is composed of six loosely coupled subsystems:
//!
//! - **`protocol`**: The wire layer. Length-prefixed bincode frames, the
//!   handshake/command/event vocabulary, and host-mask authorization.
//! - **`transport`**: The correlation transport. Many concurrent callers
//!   share one socket per node; commands are tagged with correlation
//!   indices and each caller awaits exactly its own response.
//! - **`agent`**: The storage-node side. An explicit command registry,
//!   local file operations, the inventory walk, and the dial/serve loop.
//! - **`fleet`**: The master side. Per-node lifecycle handles, the
//!   connection registry with health polling, and inventory
//!   reconciliation (remerge) for reconnecting nodes.
//! - **`selection`**: Decides which node serves a transfer, by running
//!   configured filter rules over a score card of available nodes.
//! - **`metadata`**: The seam to the file catalog: replica locations and
//!   reconciliation verdicts.

pub mod agent;
pub mod config;
pub mod error;
pub mod fleet;
pub mod metadata;
pub mod protocol;
pub mod selection;
pub mod transport;
