//! Storage Node Agent
//!
//! Everything that runs on a storage node: the command handler registry
//! mapping wire command names to local operations, the filesystem store
//! those operations act on, and the agent loop that dials the master,
//! handshakes, and serves commands until the connection drops.
//!
//! Handlers are registered explicitly by name at startup; an inbound
//! command with no registered handler is answered with an
//! `OperationNotSupported` fault instead of killing the session.

pub mod fs;
pub mod node;
pub mod registry;

#[cfg(test)]
mod tests;
