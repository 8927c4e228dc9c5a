//! Fleet Management
//!
//! The master-side view of the storage nodes: one [`node::StorageNode`]
//! handle per configured node, the registry that accepts inbound
//! connections and runs the handshake and health polling, and the
//! reconciliation driver that replays a reconnecting node's inventory
//! against the metadata store before it rejoins service.
//!
//! ## Lifecycle
//!
//! A node starts `Offline`. An accepted connection moves it through
//! `Connecting` and `Handshaking`; a successful handshake puts it into
//! `Remerging` while its inventory is reconciled, and only then does it
//! become `Available`. Poll failures (three in a row) park it in
//! `Unavailable` until it reconnects; a dropped connection returns it to
//! `Offline`.

pub mod node;
pub mod registry;
pub mod remerge;
