//! Control-Channel Protocol
//!
//! Defines the wire format spoken between the master and every storage node:
//! a single duplex TCP connection per node carrying length-prefixed bincode
//! frames. Commands flow master → node tagged with a correlation index;
//! responses flow back tagged with the same index, in whatever order the node
//! finishes them. Unsolicited traffic (inventory batches during remerge)
//! travels as `Event` frames outside the correlation table.
//!
//! ## Submodules
//! - **`types`**: the `Frame` enum, handshake messages, and the typed payload
//!   structs for every command family.
//! - **`codec`**: framed reader/writer over tokio stream halves.
//! - **`mask`**: glob-style host masks used to authorize inbound connections.

pub mod codec;
pub mod mask;
pub mod types;

#[cfg(test)]
mod tests;
