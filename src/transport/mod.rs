//! Correlation Transport
//!
//! One master-side [`link::NodeLink`] per connected storage node. Many caller
//! tasks issue commands concurrently against the same node; the link tags
//! each command with a correlation index, multiplexes them over the single
//! socket, and hands every caller a one-shot future its response will resolve.
//! A dedicated reader task per connection demultiplexes inbound frames by
//! index, so responses may arrive in any order without callers blocking each
//! other.
//!
//! Failure semantics live here too: a dropped connection drains every
//! pending call with a `NodeUnavailable` fault in one sweep, an expired
//! deadline faults only the waiting caller, and late responses for indices
//! nobody is waiting on are discarded.

pub mod link;

#[cfg(test)]
mod tests;
