//! Universe host daemon.
//!
//! Loads the TOML configuration, applies command-line overrides, installs
//! logging and runs a [`UniverseServer`] with the sandbox collaborators until
//! a termination signal arrives.

mod cli;
mod commands;
mod config;
mod logging;
mod signals;

use std::sync::Arc;
use tracing::{error, info};

use universe_server::access::StaticAccessControl;
use universe_server::sandbox::{SandboxSystemFactory, SandboxWorldFactory};
use universe_server::storage::FileStorage;
use universe_server::{ServerContext, UniverseServer};

use crate::cli::CliArgs;
use crate::commands::HostCommands;
use crate::config::AppConfig;

/// Main application struct.
pub struct Application {
    config: AppConfig,
    server: Arc<UniverseServer>,
}

impl Application {
    /// Loads configuration, applies CLI overrides and builds the server.
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        apply_overrides(&mut config, &args);

        if let Err(e) = config.validate() {
            anyhow::bail!("Configuration validation failed: {e}");
        }

        if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
            eprintln!("⚠️ Logging already initialized: {e}");
        }
        display_banner();

        let server_config = config.to_server_config()?;
        let storage = FileStorage::new(server_config.storage_directory.clone())?;
        let access = StaticAccessControl::new(server_config.accounts.clone());
        let context = ServerContext::new(
            server_config,
            Arc::new(storage),
            Arc::new(SandboxWorldFactory::default()),
            Arc::new(SandboxSystemFactory::default()),
            Arc::new(access),
        );
        let commands = HostCommands::new(context.clock.clone());
        let server = UniverseServer::new(context.with_commands(Arc::new(commands)))?;

        info!("📂 Config: {} | Storage: {}", args.config_path.display(), config.server.storage_directory);

        Ok(Self {
            config,
            server: Arc::new(server),
        })
    }

    /// Runs the server until a shutdown signal, then stops it.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("🌟 Starting universe host");
        info!("📋 Configuration Summary:");
        if self.config.server.listen {
            info!("  🌐 Bind address: {}", self.config.server.bind_address);
        } else {
            info!("  🌐 Listener disabled");
        }
        info!("  👥 Max clients: {}", self.config.server.max_clients);
        info!("  🪐 World tick rate: {} Hz", self.config.world.tick_rate);
        info!("  ⏱️ Connection timeout: {}s", self.config.server.connection_timeout_secs);
        info!("  🔑 Accounts: {}", self.config.accounts.len());

        self.server.start()?;

        let signal_result = signals::wait_for_shutdown().await;
        if let Err(e) = &signal_result {
            error!("❌ Signal handling failed: {e}");
        }

        info!("🛑 Shutdown signal received, stopping universe...");
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || server.stop()).await?;
        info!("✅ Universe host shutdown complete");
        signal_result
    }
}

/// Applies command-line overrides on top of the file configuration.
fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(storage) = &args.storage_dir {
        config.server.storage_directory = storage.to_string_lossy().to_string();
    }
    if let Some(bind_address) = &args.bind_address {
        config.server.bind_address = bind_address.clone();
    }
    if let Some(max_clients) = args.max_clients {
        config.server.max_clients = max_clients;
    }
    if args.no_listen {
        config.server.listen = false;
    }
    if let Some(log_level) = &args.log_level {
        config.logging.level = log_level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
}

fn display_banner() {
    info!("╭───────────────────────────────────╮");
    info!("│  🌌 Universe Host v{:<15}│", env!("CARGO_PKG_VERSION"));
    info!("╰───────────────────────────────────╯");
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("❌ Failed to start universe host: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("❌ Universe host error: {e:#}");
        std::process::exit(1);
    }
}
