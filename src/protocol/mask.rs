//! Glob-style host masks.
//!
//! Each configured node carries a list of masks like `192.168.1.*` that an
//! inbound connection claiming that node name must match. An empty mask list
//! means any address is accepted (useful for lab setups; production configs
//! should always pin masks).

use anyhow::{Context, Result};
use regex::Regex;
use std::net::IpAddr;

/// Translates a glob pattern (`*` = any run, `?` = any single char) into an
/// anchored regex. Shared with the path-match selection rule.
pub fn compile_glob(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');

    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }

    expr.push('$');
    Regex::new(&expr).with_context(|| format!("bad glob pattern: {}", pattern))
}

#[derive(Debug, Clone)]
pub struct HostMask {
    pattern: String,
    regex: Regex,
}

impl HostMask {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: pattern.to_string(),
            regex: compile_glob(pattern)?,
        })
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        self.regex.is_match(&addr.to_string())
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// The mask list attached to one configured node.
#[derive(Debug, Clone, Default)]
pub struct MaskSet {
    masks: Vec<HostMask>,
}

impl MaskSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let masks = patterns
            .iter()
            .map(|p| HostMask::new(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { masks })
    }

    /// True when the address is authorized. An empty set accepts anything.
    pub fn allows(&self, addr: &IpAddr) -> bool {
        self.masks.is_empty() || self.masks.iter().any(|m| m.matches(addr))
    }
}
