//! Potato Relay Library
//!
//! Off-chain relay for the potato vendor locker marketplace. It watches the
//! vendor contract, pulls payment and reserves a locker for each purchase,
//! emails buyers along the way, and opens lockers for buyers who prove
//! ownership with a signature.

pub mod types;
pub mod error;
pub mod config;
pub mod metric;
pub mod chain;
pub mod events;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod signature;
pub mod notifications;
pub mod api;

#[cfg(test)]
mod test_utils;

pub use crate::config::initialize_default_config;
pub use crate::error::{RelayError, RelayResult, VerificationError};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiContext;
use crate::chain::{EthVendorClient, VendorChain};
use crate::config::ConfigManager;
use crate::events::EventCodec;
use crate::listener::EventListener;
use crate::notifications::{LogMailer, Mailer, SmtpMailer};
use crate::queue::EventQueue;
use crate::relay::RelayWorker;

/// Which services [`AppState::start`] brings up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Listener, relay worker and (if enabled) the API
    Full,
    /// Only the HTTP API
    ApiOnly,
}

/// Application state: wires configuration, chain client, mailer, queue,
/// worker, listener and API together and owns their lifecycle.
pub struct AppState {
    /// Configuration manager, loaded before `start`
    pub config: Arc<ConfigManager>,

    /// Event queue producer; None in API-only mode
    pub queue: Option<EventQueue>,

    /// Shutdown signal shared by every background task
    shutdown_tx: Option<watch::Sender<bool>>,

    /// Handles to background tasks, joined on `stop`
    pub background_tasks: Vec<JoinHandle<()>>,
}

impl AppState {
    /// Create a new application state with given configuration
    pub fn new(config_manager: Arc<ConfigManager>) -> Self {
        Self {
            config: config_manager,
            queue: None,
            shutdown_tx: None,
            background_tasks: Vec::new(),
        }
    }

    /// Connect to the chain and spawn the services for `mode`
    pub async fn start(&mut self, mode: RunMode) -> RelayResult<()> {
        info!("Starting potato relay ({:?})", mode);
        let config = self.config.get_config().await;

        metric::init(config.general.enable_metrics)?;

        let chain_config = config.active_chain()?.clone();
        let operator_key = chain_config.operator_key()?;
        let client = Arc::new(EthVendorClient::connect(&chain_config, &operator_key).await?);
        let chain: Arc<dyn VendorChain> = client.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        if mode == RunMode::Full {
            let mailer: Arc<dyn Mailer> = if config.mail.enabled {
                Arc::new(SmtpMailer::new(&config.mail)?)
            } else {
                warn!("Mail is disabled, buyer emails will only be logged");
                Arc::new(LogMailer)
            };

            let (queue, receiver) = EventQueue::new();
            let worker = Arc::new(RelayWorker::new(receiver, queue.notifier(), chain.clone(), mailer));
            self.background_tasks
                .push(tokio::spawn(worker.run(shutdown_rx.clone())));

            let listener = EventListener::new(
                client.clone(),
                EventCodec::new()?,
                queue.clone(),
                chain_config.start_block,
                Duration::from_millis(chain_config.poll_interval_ms),
            );
            self.background_tasks
                .push(tokio::spawn(listener.run(shutdown_rx.clone())));

            self.queue = Some(queue);
            debug!("Listener and relay worker spawned");
        }

        if config.api.enable_api {
            let ctx = ApiContext::new(chain, self.queue.clone(), &config.general.service_name);
            let (_, server) = match api::bind(ctx, &config.api, shutdown_rx) {
                Ok(bound) => bound,
                Err(e) => {
                    error!("API server failed to start: {}", e);
                    self.stop().await?;
                    return Err(e);
                }
            };
            self.background_tasks.push(tokio::spawn(server));
        } else if mode == RunMode::ApiOnly {
            return Err(RelayError::Config("API is disabled in configuration".to_string()));
        } else {
            info!("API server is disabled in config");
        }

        info!("All services started");
        Ok(())
    }

    /// Signal shutdown and wait for the background tasks to finish
    pub async fn stop(&mut self) -> RelayResult<()> {
        info!("Stopping potato relay");

        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(true).is_err() {
                warn!("Shutdown signal had no receivers");
            }
        }

        for task in self.background_tasks.drain(..) {
            match tokio::time::timeout(Duration::from_secs(30), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Background task failed: {}", e),
                Err(_) => warn!("Background task did not stop within 30s"),
            }
        }

        info!("Potato relay stopped");
        Ok(())
    }
}

/// Initialize logging
///
/// `RUST_LOG` wins over `log_level` when set.
pub fn init_logging(log_level: &str, json: bool) -> RelayResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| RelayError::Config(format!("Invalid log level {}: {}", log_level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| RelayError::Config(format!("Failed to set global default subscriber: {}", e)))?;

    info!("Logging initialized at {} level", log_level);
    Ok(())
}

/// Version information
pub mod version {
    /// Current version from Cargo.toml
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Get a greeting message with version info
pub fn greeting() -> String {
    format!("Potato Relay v{} starting up", version::VERSION)
}
