use filefleet::agent::node::{AgentConfig, NodeAgent};
use filefleet::config::MasterConfig;
use filefleet::fleet::registry::NodeRegistry;
use filefleet::metadata::MemoryStore;
use filefleet::protocol::types::{Capabilities, EXT_BASIC, EXT_TRANSFER};
use filefleet::selection::engine::SelectionEngine;
use filefleet::selection::filters::build_rules;

use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Default)]
struct CliArgs {
    role: Option<String>,
    config_path: Option<PathBuf>,
    name: Option<String>,
    master_addr: Option<String>,
    root: Option<PathBuf>,
    capacity_gb: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        usage(&args[0]);
        std::process::exit(1);
    }

    let parsed = match parse_args(&args[1..]) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {}", e);
            usage(&args[0]);
            std::process::exit(1);
        }
    };

    match parsed.role.as_deref() {
        Some("master") => {
            let config_path = parsed.config_path.ok_or_else(|| {
                anyhow::anyhow!("--config is required for the master role")
            })?;
            run_master(config_path).await
        }
        Some("node") => {
            let name = parsed.name.ok_or_else(|| anyhow::anyhow!("--name is required"))?;
            let master_addr = parsed
                .master_addr
                .ok_or_else(|| anyhow::anyhow!("--master is required"))?;
            let root = parsed.root.ok_or_else(|| anyhow::anyhow!("--root is required"))?;
            run_node(name, master_addr, root, parsed.capacity_gb).await
        }
        _ => {
            usage(&args[0]);
            std::process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> anyhow::Result<CliArgs> {
    let mut parsed = CliArgs {
        capacity_gb: 100,
        ..CliArgs::default()
    };

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--role" | "--config" | "--name" | "--master" | "--root" | "--capacity-gb" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("{} needs a value", flag))?;

                match flag {
                    "--role" => parsed.role = Some(value.clone()),
                    "--config" => parsed.config_path = Some(PathBuf::from(value)),
                    "--name" => parsed.name = Some(value.clone()),
                    "--master" => parsed.master_addr = Some(value.clone()),
                    "--root" => parsed.root = Some(PathBuf::from(value)),
                    _ => {
                        parsed.capacity_gb = value
                            .parse()
                            .map_err(|_| anyhow::anyhow!("--capacity-gb needs a number"))?
                    }
                }
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    Ok(parsed)
}

fn usage(bin: &str) {
    eprintln!("Usage:");
    eprintln!("  {} --role master --config <path.toml>", bin);
    eprintln!(
        "  {} --role node --name <name> --master <addr:port> --root <dir> [--capacity-gb <n>]",
        bin
    );
}

async fn run_master(config_path: PathBuf) -> anyhow::Result<()> {
    let config = MasterConfig::load(&config_path)?;
    tracing::info!(
        "Master config loaded: {} node(s), {} filter rule(s)",
        config.nodes.len(),
        config.filters.len()
    );

    // 1. Metadata store:
    let metadata = Arc::new(MemoryStore::new());

    // 2. Selection rule chain (fail fast on bad patterns):
    let rules = build_rules(&config.filters)?;

    // 3. Node registry:
    let registry = NodeRegistry::new(config, metadata.clone())?;

    // Selection is driven by whatever frontend embeds this crate; the
    // engine here validates the configured chain and stands ready.
    let engine = SelectionEngine::new(registry.clone(), metadata, rules);
    tracing::info!("Selection engine ready ({} rule(s))", engine.rule_count());

    // 4. Spawn stats reporter:
    let stats_registry = registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));

        loop {
            interval.tick().await;
            let status = stats_registry.fleet_status();
            tracing::info!(
                "Fleet: {}/{} available, {} remerging, {} unavailable, {} offline",
                status.available,
                status.total,
                status.remerging,
                status.unavailable,
                status.offline
            );
        }
    });

    // 5. Accept node connections until shutdown:
    tracing::info!("Press Ctrl+C to shutdown");
    registry.listen().await
}

async fn run_node(
    name: String,
    master_addr: String,
    root: PathBuf,
    capacity_gb: u64,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&root).await?;

    let agent = NodeAgent::new(AgentConfig {
        name,
        master_addr,
        root,
        capacity_bytes: capacity_gb * 1024 * 1024 * 1024,
        extensions: vec![EXT_BASIC.to_string(), EXT_TRANSFER.to_string()],
        capabilities: Capabilities {
            encrypted_channel: false,
        },
    });

    tracing::info!("Press Ctrl+C to shutdown");
    agent.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_full_node_invocation_parses() {
        let parsed = parse_args(&argv(&[
            "--role", "node", "--name", "alpha", "--master", "127.0.0.1:2600", "--root", "/srv",
            "--capacity-gb", "250",
        ]))
        .unwrap();

        assert_eq!(parsed.role.as_deref(), Some("node"));
        assert_eq!(parsed.name.as_deref(), Some("alpha"));
        assert_eq!(parsed.master_addr.as_deref(), Some("127.0.0.1:2600"));
        assert_eq!(parsed.root.as_deref(), Some(std::path::Path::new("/srv")));
        assert_eq!(parsed.capacity_gb, 250);
    }

    #[test]
    fn test_trailing_flag_without_value_is_an_error() {
        for flag in ["--role", "--config", "--name", "--master", "--root", "--capacity-gb"] {
            let result = parse_args(&argv(&["--role", "node", flag]));
            assert!(result.is_err(), "{} without a value must not parse", flag);
        }
    }

    #[test]
    fn test_bad_capacity_is_an_error() {
        assert!(parse_args(&argv(&["--capacity-gb", "lots"])).is_err());
    }

    #[test]
    fn test_unknown_tokens_are_skipped() {
        let parsed = parse_args(&argv(&["stray", "--role", "master", "--config", "m.toml"])).unwrap();
        assert_eq!(parsed.role.as_deref(), Some("master"));
        assert_eq!(
            parsed.config_path.as_deref(),
            Some(std::path::Path::new("m.toml"))
        );
    }
}
