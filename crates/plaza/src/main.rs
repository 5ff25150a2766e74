//! Plaza presence server.
//!
//! Loads configuration, installs logging, registers the packet handlers and
//! runs the server until a shutdown signal arrives.

mod cli;
mod config;
mod handlers;
mod logging;
mod signals;

use anyhow::{anyhow, Context, Result};
use cli::CliArgs;
use config::AppConfig;
use plaza_server::{PacketRouter, PresenceServer};
use std::sync::Arc;
use tracing::info;

/// The hosting process: configuration plus a bound server.
pub struct Application {
    config: AppConfig,
    server: PresenceServer,
}

impl Application {
    pub async fn new(args: CliArgs) -> Result<Self> {
        // Configuration is loaded before logging so the file can set the level.
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(address) = args.reliable_bind {
            config.server.reliable_bind_address = address;
        }
        if let Some(address) = args.unreliable_bind {
            config.server.unreliable_bind_address = address;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

        logging::setup_logging(&config.logging)?;

        let server = PresenceServer::bind_with(config.to_server_config()?, |registry| {
            PacketRouter::new().with_handlers(handlers::all_handlers(registry.clone()))
        })
        .await
        .context("binding listeners")?;
        let announcer = handlers::PresenceAnnouncer::new(server.registry());
        let server = server.with_observer(Arc::new(announcer));

        info!("📂 Config: {}", args.config_path.display());

        Ok(Self { config, server })
    }

    pub async fn run(self) -> Result<()> {
        info!("🌟 Starting Plaza Presence Server v{}", env!("CARGO_PKG_VERSION"));
        info!("📋 Configuration Summary:");
        info!("  🌐 Reliable (TCP): {}", self.server.reliable_addr());
        info!("  📡 Unreliable (UDP): {}", self.server.unreliable_addr());
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!(
            "  ⏱️ AFK after {}s, expire after {}s",
            self.config.session.afk_timeout_secs, self.config.session.session_timeout_secs
        );

        tokio::spawn(signals::cancel_on_signal(self.server.shutdown_token()));

        self.server.run().await?;
        info!("👋 Plaza server shut down");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let app = Application::new(args).await?;
    app.run().await
}
