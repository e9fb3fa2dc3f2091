//! wallet-bg: headless wallet background service

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use wallet_bg_adapters::RuntimeConfig;

mod commands;

#[derive(Parser)]
#[command(author, version, about = "Multi-chain wallet background service")]
struct Cli {
    /// Chain list (JSON); overrides WALLET_BG_CHAIN_LIST
    #[arg(long, global = true)]
    chains: Option<PathBuf>,
    /// State directory; overrides WALLET_BG_STORE_DIR
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every active chain and serve until interrupted
    Run,
    /// Open one provider, report its identity, close it again
    Probe {
        url: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Check a custom provider against the chain list
    Validate {
        url: String,
        /// Existing chain the provider should belong to
        #[arg(long)]
        chain: Option<String>,
    },
    /// Read a password from stdin and store its verifier
    SetPassword,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = RuntimeConfig::from_env();
    if let Some(chains) = cli.chains {
        config.chain_list_path = Some(chains);
    }
    if let Some(dir) = cli.store_dir {
        config.store_dir = dir;
    }

    match cli.command {
        Commands::Run => commands::run(config).await,
        Commands::Probe { url, timeout_ms } => {
            commands::probe_url(&config, &url, timeout_ms).await
        }
        Commands::Validate { url, chain } => {
            commands::validate(&config, &url, chain.as_deref()).await
        }
        Commands::SetPassword => commands::set_password(&config).await,
    }
}
