/// Potato Relay - Main entry point
///
/// This file contains the main function and the CLI of the potato relay daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ethers::types::{Address, H256};
use tokio::signal;
use tracing::{error, info};

use potato_relay::{
    chain::{EthVendorClient, VendorChain},
    config::{ConfigManager, DEFAULT_CONFIG_PATH},
    greeting, init_logging, initialize_default_config,
    signature::{locker_digest, locker_message_hash, LockerAuthorizer},
    types::{LockerOpenRequest, LockerSignature},
    AppState, RunMode,
};

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Subcommands
#[derive(Subcommand)]
enum Commands {
    /// Generate default configuration
    Init,

    /// Run the listener, relay worker and API
    Run,

    /// Run API server only
    Api,

    /// Test the connection to the active chain profile
    TestChain,

    /// Print the digest and signed-message hash for a locker number
    LockerHash {
        /// Locker number (0-255)
        locker: u8,
    },

    /// Verify a locker signature and send openLocker
    OpenLocker {
        /// Locker number (0-255)
        #[arg(long)]
        locker: u8,

        /// Buyer address that signed
        #[arg(long)]
        signer: String,

        #[arg(long)]
        v: u8,

        /// 0x-prefixed 32-byte hex
        #[arg(long)]
        r: String,

        /// 0x-prefixed 32-byte hex
        #[arg(long)]
        s: String,

        /// Signed-message hash; computed from the locker number when omitted
        #[arg(long)]
        message_hash: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env là tuỳ chọn
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config_manager = Arc::new(ConfigManager::new(&cli.config));

    let command = cli.command.unwrap_or(Commands::Run);

    // init ghi đè file cấu hình, không cần đọc nó trước
    if !matches!(command, Commands::Init) {
        config_manager.load().await?;
    }
    let config = config_manager.get_config().await;
    let log_level = cli.log_level.unwrap_or_else(|| config.general.log_level.clone());
    init_logging(&log_level, config.general.json_logs)?;

    println!("{}", greeting());

    match command {
        Commands::Init => init_config(config_manager).await?,
        Commands::Run => run_relay(config_manager, RunMode::Full).await?,
        Commands::Api => run_relay(config_manager, RunMode::ApiOnly).await?,
        Commands::TestChain => test_chain_connection(config_manager).await?,
        Commands::LockerHash { locker } => {
            println!("locker:       {}", locker);
            println!("digest:       {:?}", locker_digest(locker));
            println!("message hash: {:?}", locker_message_hash(locker));
        }
        Commands::OpenLocker {
            locker,
            signer,
            v,
            r,
            s,
            message_hash,
        } => {
            let message_hash = match message_hash {
                Some(hash) => parse_hex::<H256>("message-hash", &hash)?,
                None => locker_message_hash(locker),
            };
            let request = LockerOpenRequest {
                locker_number: locker,
                signer: parse_hex::<Address>("signer", &signer)?,
                signature: LockerSignature {
                    v,
                    r: parse_hex::<H256>("r", &r)?,
                    s: parse_hex::<H256>("s", &s)?,
                },
                message_hash,
            };
            open_locker(config_manager, request).await?;
        }
    }

    Ok(())
}

fn parse_hex<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("--{} is not valid hex: {}", name, value))
}

/// Initialize configuration with defaults
async fn init_config(config_manager: Arc<ConfigManager>) -> Result<()> {
    info!("Initializing default configuration at {}", config_manager.config_path());

    config_manager.update_config(initialize_default_config()).await?;

    info!("Default configuration generated successfully");
    info!("Set vendor_address for your network and export OPERATOR_PRIVATE_KEY, EMAIL_USER and EMAIL_PASS");
    Ok(())
}

/// Run the relay until Ctrl+C
async fn run_relay(config_manager: Arc<ConfigManager>, mode: RunMode) -> Result<()> {
    let mut app_state = AppState::new(config_manager);
    app_state.start(mode).await.context("Failed to start relay")?;

    info!("Relay started. Press Ctrl+C to stop");
    wait_for_shutdown().await;

    app_state.stop().await?;
    Ok(())
}

async fn connect(config_manager: &ConfigManager) -> Result<EthVendorClient> {
    let config = config_manager.get_config().await;
    let chain_config = config.active_chain()?;
    let key = chain_config.operator_key()?;
    info!("Connecting to {} at {}", chain_config.name, chain_config.rpc_url);
    Ok(EthVendorClient::connect(chain_config, &key).await?)
}

/// Test chain connection
async fn test_chain_connection(config_manager: Arc<ConfigManager>) -> Result<()> {
    let client = connect(&config_manager).await?;
    let block_number = client.block_number().await?;

    info!("Connection successful!");
    info!("Latest block: {}", block_number);
    info!("Operator: {:?}", client.operator());
    Ok(())
}

/// Verify and open a locker from the command line
async fn open_locker(config_manager: Arc<ConfigManager>, request: LockerOpenRequest) -> Result<()> {
    let client: Arc<dyn VendorChain> = Arc::new(connect(&config_manager).await?);
    let tx_hash = LockerAuthorizer::new(client)
        .authorize_and_open(&request)
        .await
        .with_context(|| format!("Locker {} was not opened", request.locker_number))?;
    println!("openLocker sent: {:?}", tx_hash);
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C)
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
