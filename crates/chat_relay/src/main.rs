//! Main application entry point for the chat relay
//!
//! Loads configuration, sets up logging, and runs the relay until a
//! termination signal arrives.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Context, Result};
use chat_core::ChatServer;
use cli::CliArgs;
use config::AppConfig;
use logging::setup_logging;
use signals::wait_for_shutdown_signal;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

/// How often relay statistics are logged
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// The relay application: configuration plus the server it drives.
pub struct Application {
    config: AppConfig,
    server: Arc<ChatServer>,
}

impl Application {
    /// Load and validate configuration, install logging, and create the server.
    pub async fn new(args: CliArgs) -> Result<Self> {
        // Load configuration first (before logging setup)
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        config.apply_cli(&args);

        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

        setup_logging(&config.logging)?;

        let server_config = config.to_server_config()?;
        let server = Arc::new(ChatServer::new(server_config));

        info!(
            config = %args.config_path.display(),
            version = env!("CARGO_PKG_VERSION"),
            "Chat relay initialized"
        );

        Ok(Self { config, server })
    }

    /// Serve until a termination signal arrives, then shut down cleanly.
    pub async fn run(self) -> Result<()> {
        let settings = &self.config.server;
        info!(
            bind_address = %settings.bind_address,
            ws_path = %settings.ws_path,
            max_connections = settings.max_connections,
            event_queue_capacity = settings.event_queue_capacity,
            send_timeout_ms = settings.send_timeout_ms,
            idle_timeout_secs = settings.idle_timeout_secs,
            leave_on_disconnect = settings.leave_on_disconnect,
            "Starting chat relay"
        );

        let listener = self
            .server
            .bind()
            .await
            .with_context(|| format!("Failed to listen on {}", settings.bind_address))?;

        let mut server_handle = {
            let server = self.server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let monitoring_handle = {
            let server = self.server.clone();
            tokio::spawn(async move {
                let mut ticker = interval(STATS_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match server.stats().await {
                        Ok(stats) => info!(
                            live = stats.live_connections,
                            registered = stats.registered_connections,
                            users = stats.joined_users,
                            "Relay health"
                        ),
                        Err(e) => {
                            warn!(error = %e, "Stopping health reports");
                            break;
                        }
                    }
                }
            })
        };

        info!("Press Ctrl+C to shut down");

        let serve_result = tokio::select! {
            signal = wait_for_shutdown_signal() => {
                signal?;
                None
            }
            finished = &mut server_handle => Some(finished),
        };

        monitoring_handle.abort();
        info!("Shutting down, closing all connections");
        self.server.shutdown().await?;

        let serve_result = match serve_result {
            Some(finished) => finished,
            None => server_handle.await,
        };
        serve_result
            .context("Accept loop task failed")?
            .context("Accept loop stopped with an error")?;

        info!("Chat relay shutdown complete");
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Failed to start chat relay: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("Chat relay error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}
