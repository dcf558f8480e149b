//! SwarmRoute CLI
//!
//! Bootstrap the node pool, inspect paths and swarms, and store, retrieve
//! or poll messages over onion paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use rand::seq::SliceRandom;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use swarmroute_client::{MessageDispatcher, RoutingContext, SwarmPoller};
use swarmroute_core::{Node, OnionPath, RoutingConfig};
use swarmroute_logging::LogLevel;
use swarmroute_network::{default_seed_nodes, parse_seed_entry, HttpTransport, RetrievedMessage};
use swarmroute_store::{
    default_config_path, default_data_dir, default_key_dir, expand_path,
    load_or_generate_signing_keypair, JsonFileStore,
};

const STATE_FILE: &str = "state.json";

/// Fourteen days, the longest TTL storage nodes accept
const DEFAULT_TTL_MS: u64 = 14 * 24 * 60 * 60 * 1000;

/// SwarmRoute - onion-routed access to swarm storage
#[derive(Parser)]
#[command(name = "swarmroute")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON routing config (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the routing state file
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Seed node, `url[|fallback]`; repeat for several. Replaces configured seeds.
    #[arg(long = "seed", global = true)]
    seeds: Vec<String>,

    /// -v for debug, -vv for trace
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh the node pool from the network or a seed
    Bootstrap,

    /// Build onion paths and print them
    Paths,

    /// Show the swarm serving an identity
    Swarm { identity: String },

    /// Fetch messages for an identity from one swarm member
    Retrieve {
        identity: String,

        /// Only messages newer than this hash
        #[arg(long)]
        since: Option<String>,

        /// Sign the request with this ed25519 key file (created if missing)
        #[arg(long)]
        keyfile: Option<PathBuf>,
    },

    /// Store a base64 message in an identity's swarm
    Store {
        identity: String,

        /// Base64 payload
        data: String,

        /// Time to live in milliseconds
        #[arg(long, default_value_t = DEFAULT_TTL_MS)]
        ttl: u64,
    },

    /// Poll identities until Ctrl-C, printing new messages as JSON lines
    Poll {
        #[arg(required = true)]
        identities: Vec<String>,

        /// Sign retrieves with `<key dir>/<identity>.key`
        #[arg(long)]
        sign: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    swarmroute_logging::try_init(LogLevel::from_verbosity(cli.verbose).quiet_or(cli.quiet))
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let config = load_config(cli.config.as_deref(), &cli.seeds)?;
    let ctx = open_context(config, cli.state_dir.as_deref())?;

    match cli.command {
        Commands::Bootstrap => bootstrap(&ctx).await,
        Commands::Paths => paths(&ctx).await,
        Commands::Swarm { identity } => swarm(&ctx, &identity).await,
        Commands::Retrieve {
            identity,
            since,
            keyfile,
        } => retrieve(&ctx, &identity, since.as_deref(), keyfile.as_deref()).await,
        Commands::Store { identity, data, ttl } => store(&ctx, &identity, data, ttl).await,
        Commands::Poll { identities, sign } => poll(ctx, identities, sign).await,
    }
}

// ============================================================================
// Setup
// ============================================================================

/// Config file (explicit, else the default location when present) with
/// command-line seeds taking precedence
fn load_config(path: Option<&Path>, seeds: &[String]) -> Result<RoutingConfig> {
    let mut config = match path {
        Some(path) => RoutingConfig::from_json_file(&expand_path(path))?,
        None => {
            let default = default_config_path();
            if default.exists() {
                info!("Using config {:?}", default);
                RoutingConfig::from_json_file(&default)?
            } else {
                RoutingConfig::default()
            }
        }
    };

    if !seeds.is_empty() {
        config.seed_nodes = seeds
            .iter()
            .map(|s| parse_seed_entry(s).with_context(|| format!("Invalid seed: {}", s)))
            .collect::<Result<_>>()?;
    } else if config.seed_nodes.is_empty() {
        config.seed_nodes = default_seed_nodes();
    }
    Ok(config)
}

fn open_context(config: RoutingConfig, state_dir: Option<&Path>) -> Result<RoutingContext> {
    let dir = state_dir.map(expand_path).unwrap_or_else(default_data_dir);
    let store = JsonFileStore::open(&dir.join(STATE_FILE))
        .with_context(|| format!("Failed to open routing state in {:?}", dir))?;
    let transport = HttpTransport::new().context("Failed to create HTTP transport")?;

    Ok(RoutingContext::new(config, Arc::new(transport), Arc::new(store))?)
}

/// Token cancelled by the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

fn describe(node: &Node) -> String {
    format!("{} ({})", node.id().short(), node.address())
}

fn node_json(node: &Node) -> serde_json::Value {
    json!({
        "pubkey_ed25519": node.id().to_string(),
        "ip": node.ip,
        "port": node.port,
    })
}

// ============================================================================
// Commands
// ============================================================================

async fn bootstrap(ctx: &RoutingContext) -> Result<()> {
    let count = ctx.refresh_pool().await?;
    println!("{}", json!({ "pool_size": count }));
    Ok(())
}

async fn paths(ctx: &RoutingContext) -> Result<()> {
    let count = ctx.build_paths().await?;
    info!("Built {} onion paths", count);
    for line in path_lines(&ctx.paths().paths()) {
        println!("{}", line);
    }
    Ok(())
}

async fn swarm(ctx: &RoutingContext, identity: &str) -> Result<()> {
    let members = ctx.get_swarm(identity, &cancel_on_ctrl_c()).await?;
    println!("{}", swarm_line(identity, &members));
    Ok(())
}

async fn retrieve(
    ctx: &RoutingContext,
    identity: &str,
    since: Option<&str>,
    keyfile: Option<&Path>,
) -> Result<()> {
    if let Some(keyfile) = keyfile {
        ctx.register_signing_key(identity, load_or_generate_signing_keypair(keyfile)?);
    }

    let cancel = cancel_on_ctrl_c();
    let members = ctx.get_swarm(identity, &cancel).await?;
    let node = members
        .choose(&mut rand::thread_rng())
        .cloned()
        .context("Swarm has no members")?;
    info!("Retrieving from {}", describe(&node));

    let result = ctx
        .retrieve_messages(identity, &node, since, &cancel)
        .await?;
    for message in &result.messages {
        println!("{}", message_line(identity, message));
    }
    if result.more {
        warn!("Node has more messages, retrieve again with --since");
    }
    Ok(())
}

async fn store(ctx: &RoutingContext, identity: &str, data: String, ttl: u64) -> Result<()> {
    let result = ctx
        .store_message(identity, data, ttl, &cancel_on_ctrl_c())
        .await?;
    println!("{}", json!({ "identity": identity, "hash": result.hash }));
    Ok(())
}

async fn poll(ctx: RoutingContext, identities: Vec<String>, sign: bool) -> Result<()> {
    if sign {
        for identity in &identities {
            let keyfile = default_key_dir().join(format!("{}.key", identity));
            ctx.register_signing_key(identity.clone(), load_or_generate_signing_keypair(&keyfile)?);
        }
    }

    let poller = Arc::new(SwarmPoller::new(ctx, Arc::new(PrintDispatcher)));
    let cancel = cancel_on_ctrl_c();
    let handle = poller.start(identities, cancel.clone());

    info!("Polling. Press Ctrl+C to stop.");
    handle.await.context("Poller task failed")?;
    if !cancel.is_cancelled() {
        bail!("Poller stopped unexpectedly");
    }
    Ok(())
}

fn path_lines(paths: &[OnionPath]) -> Vec<String> {
    paths
        .iter()
        .map(|path| {
            let hops: Vec<_> = path.nodes().iter().map(node_json).collect();
            json!({ "guard": path.guard().id().to_string(), "hops": hops }).to_string()
        })
        .collect()
}

fn swarm_line(identity: &str, members: &[Node]) -> String {
    let members: Vec<_> = members.iter().map(node_json).collect();
    json!({ "identity": identity, "members": members }).to_string()
}

fn message_line(identity: &str, message: &RetrievedMessage) -> String {
    json!({
        "identity": identity,
        "hash": message.hash,
        "data": message.data,
        "expiration": message.expiration,
    })
    .to_string()
}

/// Writes each message to stdout as one JSON line
struct PrintDispatcher;

#[async_trait]
impl MessageDispatcher for PrintDispatcher {
    async fn dispatch(&self, identity: &str, message: RetrievedMessage) {
        println!("{}", message_line(identity, &message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "swarmroute",
            "paths",
            "--seed",
            "https://seed1.test",
            "--seed",
            "https://seed2.test|https://seed2-alt.test",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.seeds.len(), 2);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Paths));
    }

    #[test]
    fn test_store_default_ttl() {
        let cli = Cli::try_parse_from(["swarmroute", "store", "alice", "aGk="]).unwrap();
        match cli.command {
            Commands::Store { identity, data, ttl } => {
                assert_eq!(identity, "alice");
                assert_eq!(data, "aGk=");
                assert_eq!(ttl, DEFAULT_TTL_MS);
            }
            _ => panic!("expected store"),
        }
    }

    #[test]
    fn test_poll_requires_identity() {
        assert!(Cli::try_parse_from(["swarmroute", "poll"]).is_err());
        let cli = Cli::try_parse_from(["swarmroute", "poll", "alice", "bob", "--sign"]).unwrap();
        assert!(matches!(cli.command, Commands::Poll { ref identities, sign: true } if identities.len() == 2));
    }

    #[test]
    fn test_load_config_with_seed_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"path_length": 4, "seed_nodes": [{"url": "https://file.test"}]}"#).unwrap();

        let config = load_config(Some(&path), &[]).unwrap();
        assert_eq!(config.path_length, 4);
        assert_eq!(config.seed_nodes[0].url, "https://file.test");

        let config = load_config(Some(&path), &["https://cli.test|https://cli-alt.test".into()]).unwrap();
        assert_eq!(config.seed_nodes.len(), 1);
        assert_eq!(config.seed_nodes[0].url, "https://cli.test");
        assert_eq!(config.seed_nodes[0].fallback_url.as_deref(), Some("https://cli-alt.test"));
    }

    #[test]
    fn test_load_config_rejects_bad_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(load_config(Some(&path), &["ftp://nope".into()]).is_err());
    }

    #[test]
    fn test_message_line_is_json() {
        let message = RetrievedMessage {
            hash: "h1".into(),
            data: "aGk=".into(),
            expiration: 42,
        };
        let value: serde_json::Value = serde_json::from_str(&message_line("alice", &message)).unwrap();
        assert_eq!(value["identity"], "alice");
        assert_eq!(value["expiration"], 42);
    }

    #[test]
    fn test_quiet_flag() {
        let cli = Cli::try_parse_from(["swarmroute", "-q", "bootstrap"]).unwrap();
        assert!(cli.quiet);
        assert_eq!(LogLevel::from_verbosity(cli.verbose).quiet_or(cli.quiet), LogLevel::Warn);
        assert!(Cli::try_parse_from(["swarmroute", "-q", "-v", "bootstrap"]).is_err());
    }

    #[test]
    fn test_swarm_and_path_lines_are_json() {
        let nodes: Vec<Node> = (1..=3u8)
            .map(|n| Node {
                ip: format!("10.0.{}.1", n),
                port: 22021,
                pubkey_x25519: [n; 32],
                pubkey_ed25519: swarmroute_core::NodeId::from_bytes([n + 50; 32]),
                version: String::new(),
            })
            .collect();

        let swarm: serde_json::Value = serde_json::from_str(&swarm_line("alice", &nodes)).unwrap();
        assert_eq!(swarm["identity"], "alice");
        assert_eq!(swarm["members"].as_array().unwrap().len(), 3);
        assert_eq!(swarm["members"][0]["ip"], "10.0.1.1");

        let path = OnionPath::new(nodes[0].clone(), nodes[1..].to_vec());
        let lines = path_lines(&[path]);
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["guard"], nodes[0].id().to_string());
        assert_eq!(value["hops"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_state_dir_opens_store() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = open_context(RoutingConfig::default(), Some(dir.path())).unwrap();
        assert!(ctx.pool().is_empty());
    }
}
