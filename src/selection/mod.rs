//! Node Selection
//!
//! Picks the node a transfer should use. Every available node is seeded
//! into a [`scorecard::ScoreCard`] at score zero, the configured filter
//! rules run in priority order (each may adjust scores or remove nodes
//! outright), and the surviving node with the strictly highest score wins.
//! Ties go to the earliest-seeded node, and seeding is in stable name
//! order, so the same fleet and the same request always select the same
//! node.

pub mod engine;
pub mod filters;
pub mod scorecard;
