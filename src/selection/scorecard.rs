//! Candidate scoring during one selection round.

use crate::fleet::node::StorageNode;
use std::sync::Arc;

/// Candidate nodes with running scores, in seeding order. The order is
/// load-bearing: [`winner`](ScoreCard::winner) breaks ties in favor of
/// the earliest-seeded candidate.
pub struct ScoreCard {
    entries: Vec<(Arc<StorageNode>, i64)>,
}

impl ScoreCard {
    /// Seeds every candidate at score zero, preserving the given order.
    pub fn new(candidates: Vec<Arc<StorageNode>>) -> Self {
        Self {
            entries: candidates.into_iter().map(|node| (node, 0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(node, _)| node.name() == name)
    }

    pub fn score_of(&self, name: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(node, _)| node.name() == name)
            .map(|(_, score)| *score)
    }

    /// Adjusts one candidate's score. Unknown names are ignored; the node
    /// was removed by an earlier rule.
    pub fn add_score(&mut self, name: &str, delta: i64) {
        if let Some((_, score)) = self.entries.iter_mut().find(|(node, _)| node.name() == name) {
            *score += delta;
        }
    }

    pub fn add_score_all(&mut self, delta: i64) {
        for (_, score) in &mut self.entries {
            *score += delta;
        }
    }

    /// Removes a candidate from the round entirely.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(node, _)| node.name() != name);
    }

    pub fn retain<F: FnMut(&Arc<StorageNode>) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|(node, _)| keep(node));
    }

    /// Iterates the surviving candidates in seeding order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<StorageNode>> {
        self.entries.iter().map(|(node, _)| node)
    }

    /// The highest-scored survivor. Only a strictly greater score displaces
    /// the current best, so the earliest-seeded candidate wins a tie.
    pub fn winner(&self) -> Option<Arc<StorageNode>> {
        let mut best: Option<(&Arc<StorageNode>, i64)> = None;

        for (node, score) in &self.entries {
            match best {
                Some((_, best_score)) if *score <= best_score => {}
                _ => best = Some((node, *score)),
            }
        }

        best.map(|(node, _)| node.clone())
    }
}
