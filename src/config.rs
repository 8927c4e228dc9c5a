//! Master configuration loading.
//!
//! Typed TOML config: listener address, handshake-required extensions, the
//! static node table (name + authorization masks), poll/remerge tuning, and
//! the ordered selection filter rules. Loading happens once at startup; any
//! parse or validation error aborts the process rather than degrading
//! silently.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Address the master listens on for inbound node connections.
    pub listen_addr: String,

    /// Extension families every node must advertise during handshake.
    #[serde(default = "default_required_extensions")]
    pub required_extensions: Vec<String>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Per-poll deadline for ping/status calls.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Default deadline for ordinary commands.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Queue depth at which the master pauses a remerging node.
    #[serde(default = "default_remerge_pause_threshold")]
    pub remerge_pause_threshold: usize,

    /// Queue depth at which a paused remerge is resumed.
    #[serde(default = "default_remerge_resume_threshold")]
    pub remerge_resume_threshold: usize,

    #[serde(default = "default_remerge_batch_size")]
    pub remerge_batch_size: usize,

    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeEntry>,

    #[serde(default, rename = "filter")]
    pub filters: Vec<FilterRuleConfig>,
}

/// One statically known storage node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    /// Address masks authorized to connect as this node. Empty = any.
    #[serde(default)]
    pub masks: Vec<String>,
}

/// One configured selection rule. The tag is the rule name; an unknown name
/// fails deserialization, which makes a typo a startup error.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum FilterRuleConfig {
    Minfreespace {
        priority: u32,
        min_free_bytes: u64,
    },
    Matchpath {
        priority: u32,
        /// Glob over the target path.
        pattern: String,
        /// Assign directives: `<node>+N`, `<node>-N`, `all+N`, `all-N`,
        /// `<node>-remove`, `all-remove`.
        assign: String,
    },
    Activetransfers {
        priority: u32,
        /// Score subtracted per active transfer on the node.
        penalty: i64,
    },
    Affinity {
        priority: u32,
        /// Added to nodes already holding the inode on download.
        bonus: i64,
        /// Subtracted from nodes already holding the inode on upload.
        penalty: i64,
    },
    Excludesource {
        priority: u32,
    },
}

impl FilterRuleConfig {
    pub fn priority(&self) -> u32 {
        match self {
            FilterRuleConfig::Minfreespace { priority, .. } => *priority,
            FilterRuleConfig::Matchpath { priority, .. } => *priority,
            FilterRuleConfig::Activetransfers { priority, .. } => *priority,
            FilterRuleConfig::Affinity { priority, .. } => *priority,
            FilterRuleConfig::Excludesource { priority } => *priority,
        }
    }
}

fn default_required_extensions() -> Vec<String> {
    vec![crate::protocol::types::EXT_BASIC.to_string()]
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_poll_timeout_secs() -> u64 {
    10
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_remerge_pause_threshold() -> usize {
    250
}

fn default_remerge_resume_threshold() -> usize {
    50
}

fn default_remerge_batch_size() -> usize {
    128
}

impl MasterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: MasterConfig = toml::from_str(raw)?;

        if config.remerge_resume_threshold >= config.remerge_pause_threshold {
            anyhow::bail!(
                "remerge_resume_threshold ({}) must be below remerge_pause_threshold ({})",
                config.remerge_resume_threshold,
                config.remerge_pause_threshold
            );
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        listen_addr = "0.0.0.0:1100"
        required_extensions = ["basic", "transfer"]
        poll_interval_secs = 15

        [[node]]
        name = "alpha"
        masks = ["127.0.0.1", "192.168.1.*"]

        [[node]]
        name = "beta"

        [[filter]]
        name = "minfreespace"
        priority = 1
        min_free_bytes = 1073741824

        [[filter]]
        name = "affinity"
        priority = 2
        bonus = 1000
        penalty = 500
    "#;

    #[test]
    fn test_parse_sample() {
        let config = MasterConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:1100");
        assert_eq!(config.required_extensions, vec!["basic", "transfer"]);
        assert_eq!(config.poll_interval_secs, 15);
        // Unset fields fall back to defaults.
        assert_eq!(config.remerge_pause_threshold, 250);

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].name, "alpha");
        assert_eq!(config.nodes[0].masks.len(), 2);
        assert!(config.nodes[1].masks.is_empty());

        assert_eq!(config.filters.len(), 2);
        assert_eq!(config.filters[0].priority(), 1);
    }

    #[test]
    fn test_unknown_filter_name_is_fatal() {
        let raw = r#"
            listen_addr = "0.0.0.0:1100"

            [[filter]]
            name = "nosuchrule"
            priority = 1
        "#;

        assert!(MasterConfig::parse(raw).is_err());
    }

    #[test]
    fn test_inverted_remerge_thresholds_rejected() {
        let raw = r#"
            listen_addr = "0.0.0.0:1100"
            remerge_pause_threshold = 10
            remerge_resume_threshold = 20
        "#;

        assert!(MasterConfig::parse(raw).is_err());
    }
}
