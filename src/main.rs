use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use carechain::api;
use carechain::config::NodeConfig;
use carechain::crypto::{identity_did, load_or_create_identity, read_identity, BlockCipher};
use carechain::genesis::GenesisConfig;
use carechain::node::{Node, Verifiers};

#[derive(Parser)]
#[command(
    name = "carechain",
    version,
    about = "Permissioned ledger node for medical-record events"
)]
struct Cli {
    /// Node configuration file
    #[arg(short, long, global = true, default_value = "carechain.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node: P2P listener, HTTP API, and the block producer when
    /// BLOCK_PRODUCER is set
    Run,
    /// Prepare a node directory: configuration, producer identity, and a
    /// genesis template to share with the other founding nodes
    Init {
        /// Overwrite an existing configuration and genesis template
        #[arg(long)]
        force: bool,
    },
    /// Print the producer identity other nodes will see in handshakes
    Identity,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run => run(&cli.config).await,
        Command::Init { force } => init(&cli.config, force),
        Command::Identity => identity(&cli.config),
    }
}

async fn run(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        bail!(
            "no configuration at {}; run `carechain init` first",
            config_path.display()
        );
    }
    let config = NodeConfig::load(config_path)?;
    // The at-rest encryption key must be present and well-formed before
    // anything touches the store.
    let cipher = BlockCipher::from_env().context("data-encryption key")?;
    let api_addr = config.api_listen;

    let node = Node::new(config, cipher, Verifiers::dummy())?;
    let handle = node.handle();
    let mut node_task = tokio::spawn(node.start());
    let mut api_task = tokio::spawn(api::serve(handle, api_addr));

    tokio::select! {
        res = &mut node_task => res.context("node task")??,
        res = &mut api_task => res.context("api task")??,
        _ = signal::ctrl_c() => info!("shutdown signal received"),
    }
    Ok(())
}

fn init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }
    let mut config = NodeConfig::default();
    config.apply_env();
    config.ensure_directories()?;
    config.save(config_path)?;

    let keypair = load_or_create_identity(&config.key_path)?;
    if !config.genesis_path.exists() || force {
        let genesis = GenesisConfig::default();
        fs::write(
            &config.genesis_path,
            serde_json::to_vec_pretty(&genesis).context("encoding genesis template")?,
        )?;
        info!(path = %config.genesis_path.display(), "wrote genesis template");
    }

    info!(path = %config_path.display(), "node directory prepared");
    println!("configuration: {}", config_path.display());
    println!("identity:      {}", config.key_path.display());
    println!("producer DID:  {}", identity_did(&keypair.public));
    Ok(())
}

fn identity(config_path: &Path) -> Result<()> {
    let config = if config_path.exists() {
        NodeConfig::load(config_path)?
    } else {
        NodeConfig::default()
    };
    if !config.key_path.exists() {
        bail!(
            "no identity at {}; run `carechain init` first",
            config.key_path.display()
        );
    }
    let keypair = read_identity(&config.key_path)?;
    println!("{}", identity_did(&keypair.public));
    Ok(())
}
