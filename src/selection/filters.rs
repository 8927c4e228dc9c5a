//! Filter rules.
//!
//! Each rule inspects the request context and adjusts the score card:
//! nudging scores, or removing candidates outright. Rules are built from
//! configuration once at startup (a bad pattern or assign directive is a
//! startup error, not a per-request one) and run in ascending priority
//! order.
//!
//! The assign grammar of the `matchpath` rule is a comma list of
//! directives: `alpha+100` and `alpha-100` adjust one node's score,
//! `all+100` / `all-100` adjust every candidate, and `alpha-remove` /
//! `all-remove` drop candidates from the round.

use crate::config::FilterRuleConfig;
use crate::protocol::mask::compile_glob;
use crate::protocol::types::Direction;
use crate::selection::scorecard::ScoreCard;

use anyhow::{Context, Result};
use regex::Regex;
use std::net::IpAddr;

/// Request-scoped facts the rules score against. The built-in rules only
/// look at some of these; all of them are carried so custom policy rules
/// can key on the requesting user or where they connect from.
pub struct SelectionContext<'a> {
    /// Name of the user the transfer is for.
    pub user: &'a str,
    /// Address the requesting client connected from.
    pub peer: IpAddr,
    pub direction: Direction,
    /// Virtual path of the file being transferred.
    pub path: &'a str,
    /// Node acting as the transfer source, if this is a replication.
    pub source: Option<&'a str>,
    /// Nodes already holding a replica of the inode.
    pub locations: &'a [String],
}

pub trait FilterRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, card: &mut ScoreCard, ctx: &SelectionContext<'_>);
}

/// Builds the rule chain from configuration, ascending priority.
pub fn build_rules(configs: &[FilterRuleConfig]) -> Result<Vec<Box<dyn FilterRule>>> {
    let mut ordered: Vec<&FilterRuleConfig> = configs.iter().collect();
    ordered.sort_by_key(|c| c.priority());

    let mut rules: Vec<Box<dyn FilterRule>> = Vec::with_capacity(ordered.len());
    for config in ordered {
        let rule: Box<dyn FilterRule> = match config {
            FilterRuleConfig::Minfreespace { min_free_bytes, .. } => Box::new(MinFreeSpace {
                min_free_bytes: *min_free_bytes,
            }),
            FilterRuleConfig::Matchpath {
                pattern, assign, ..
            } => Box::new(MatchPath::new(pattern, assign)?),
            FilterRuleConfig::Activetransfers { penalty, .. } => {
                Box::new(ActiveTransfers { penalty: *penalty })
            }
            FilterRuleConfig::Affinity { bonus, penalty, .. } => Box::new(Affinity {
                bonus: *bonus,
                penalty: *penalty,
            }),
            FilterRuleConfig::Excludesource { .. } => Box::new(ExcludeSource),
        };
        tracing::info!("Selection rule loaded: {}", rule.name());
        rules.push(rule);
    }

    Ok(rules)
}

/// Uploads need room: drops candidates whose last known free space is
/// under the floor. Nodes that have never reported status are kept; the
/// first poll will sort them out.
pub struct MinFreeSpace {
    pub min_free_bytes: u64,
}

impl FilterRule for MinFreeSpace {
    fn name(&self) -> &'static str {
        "minfreespace"
    }

    fn apply(&self, card: &mut ScoreCard, ctx: &SelectionContext<'_>) {
        if ctx.direction != Direction::Upload {
            return;
        }

        card.retain(|node| match node.last_status() {
            Some(status) => status.free_bytes >= self.min_free_bytes,
            None => true,
        });
    }
}

enum AssignTarget {
    All,
    Node(String),
}

enum AssignAction {
    Score(i64),
    Remove,
}

struct AssignDirective {
    target: AssignTarget,
    action: AssignAction,
}

/// Steers paths matching a glob toward (or away from) specific nodes.
pub struct MatchPath {
    pattern: Regex,
    directives: Vec<AssignDirective>,
}

impl MatchPath {
    pub fn new(pattern: &str, assign: &str) -> Result<Self> {
        Ok(Self {
            pattern: compile_glob(pattern)?,
            directives: parse_assign(assign)?,
        })
    }
}

fn parse_assign(assign: &str) -> Result<Vec<AssignDirective>> {
    let mut directives = Vec::new();

    for token in assign.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let directive = if let Some(target) = token.strip_suffix("-remove") {
            AssignDirective {
                target: parse_target(target),
                action: AssignAction::Remove,
            }
        } else if let Some(plus) = token.find('+') {
            let points: i64 = token[plus + 1..]
                .parse()
                .with_context(|| format!("bad assign token '{}'", token))?;
            AssignDirective {
                target: parse_target(&token[..plus]),
                action: AssignAction::Score(points),
            }
        } else if let Some(minus) = token.rfind('-') {
            let points: i64 = token[minus + 1..]
                .parse()
                .with_context(|| format!("bad assign token '{}'", token))?;
            AssignDirective {
                target: parse_target(&token[..minus]),
                action: AssignAction::Score(-points),
            }
        } else {
            anyhow::bail!("bad assign token '{}'", token);
        };

        directives.push(directive);
    }

    if directives.is_empty() {
        anyhow::bail!("empty assign directive");
    }
    Ok(directives)
}

fn parse_target(raw: &str) -> AssignTarget {
    if raw == "all" {
        AssignTarget::All
    } else {
        AssignTarget::Node(raw.to_string())
    }
}

impl FilterRule for MatchPath {
    fn name(&self) -> &'static str {
        "matchpath"
    }

    fn apply(&self, card: &mut ScoreCard, ctx: &SelectionContext<'_>) {
        if !self.pattern.is_match(ctx.path) {
            return;
        }

        for directive in &self.directives {
            match (&directive.target, &directive.action) {
                (AssignTarget::All, AssignAction::Score(points)) => card.add_score_all(*points),
                (AssignTarget::All, AssignAction::Remove) => card.retain(|_| false),
                (AssignTarget::Node(name), AssignAction::Score(points)) => {
                    card.add_score(name, *points)
                }
                (AssignTarget::Node(name), AssignAction::Remove) => card.remove(name),
            }
        }
    }
}

/// Penalizes busy nodes so load spreads.
pub struct ActiveTransfers {
    pub penalty: i64,
}

impl FilterRule for ActiveTransfers {
    fn name(&self) -> &'static str {
        "activetransfers"
    }

    fn apply(&self, card: &mut ScoreCard, _ctx: &SelectionContext<'_>) {
        let adjustments: Vec<(String, i64)> = card
            .nodes()
            .filter_map(|node| {
                node.last_status().map(|status| {
                    (
                        node.name().to_string(),
                        -(status.active_transfers as i64) * self.penalty,
                    )
                })
            })
            .collect();

        for (name, delta) in adjustments {
            card.add_score(&name, delta);
        }
    }
}

/// Downloads favor nodes that already hold the inode; uploads steer away
/// from them so replicas land on distinct nodes.
pub struct Affinity {
    pub bonus: i64,
    pub penalty: i64,
}

impl FilterRule for Affinity {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn apply(&self, card: &mut ScoreCard, ctx: &SelectionContext<'_>) {
        for holder in ctx.locations {
            match ctx.direction {
                Direction::Download => card.add_score(holder, self.bonus),
                Direction::Upload => card.add_score(holder, -self.penalty),
            }
        }
    }
}

/// A replication must not pick its own source as the destination.
pub struct ExcludeSource;

impl FilterRule for ExcludeSource {
    fn name(&self) -> &'static str {
        "excludesource"
    }

    fn apply(&self, card: &mut ScoreCard, ctx: &SelectionContext<'_>) {
        if let Some(source) = ctx.source {
            card.remove(source);
        }
    }
}
