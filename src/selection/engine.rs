//! Selection entry point.

use crate::error::Fault;
use crate::fleet::node::StorageNode;
use crate::fleet::registry::NodeRegistry;
use crate::metadata::MetadataStore;
use crate::protocol::types::Direction;
use crate::selection::filters::{FilterRule, SelectionContext};
use crate::selection::scorecard::ScoreCard;

use std::net::IpAddr;
use std::sync::{Arc, RwLock};

/// Runs the configured rule chain over the currently available nodes.
/// The chain sits behind a lock so it can be swapped atomically on a
/// config reload without disturbing in-flight selections.
pub struct SelectionEngine {
    registry: Arc<NodeRegistry>,
    metadata: Arc<dyn MetadataStore>,
    rules: RwLock<Vec<Box<dyn FilterRule>>>,
}

impl SelectionEngine {
    pub fn new(
        registry: Arc<NodeRegistry>,
        metadata: Arc<dyn MetadataStore>,
        rules: Vec<Box<dyn FilterRule>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            metadata,
            rules: RwLock::new(rules),
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().expect("rules lock").len()
    }

    /// Replaces the whole rule chain in one step.
    pub fn replace_rules(&self, rules: Vec<Box<dyn FilterRule>>) {
        let count = rules.len();
        *self.rules.write().expect("rules lock") = rules;
        tracing::info!("Selection rule chain replaced ({} rule(s))", count);
    }

    /// Picks the node for one transfer on behalf of `user` connecting
    /// from `peer`. Candidates are the nodes in service at this instant;
    /// nodes remerging or parked never enter the round. An empty round at
    /// any point yields `NoAvailableNode`.
    pub fn select(
        &self,
        user: &str,
        peer: IpAddr,
        direction: Direction,
        path: &str,
        source: Option<&str>,
    ) -> Result<Arc<StorageNode>, Fault> {
        let candidates = self.registry.list_available();
        if candidates.is_empty() {
            return Err(Fault::NoAvailableNode);
        }

        let locations = self.metadata.inode_locations(path);
        let ctx = SelectionContext {
            user,
            peer,
            direction,
            path,
            source,
            locations: &locations,
        };

        let mut card = ScoreCard::new(candidates);
        for rule in self.rules.read().expect("rules lock").iter() {
            rule.apply(&mut card, &ctx);
            if card.is_empty() {
                tracing::debug!("Rule '{}' emptied the round for {}", rule.name(), path);
                return Err(Fault::NoAvailableNode);
            }
        }

        let winner = card.winner().ok_or(Fault::NoAvailableNode)?;
        tracing::debug!(
            "Selected node '{}' for {:?} of {}",
            winner.name(),
            direction,
            path
        );
        Ok(winner)
    }
}
