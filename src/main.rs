use anyhow::Result;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ln_gateway::{config::Config, GatewayApp};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration comes first so the log level can be taken from it
    let (config, source) = load_config().await?;

    init_tracing(&config);

    info!("Starting ln-gateway...");
    match source {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    // Create and run the gateway
    let app = GatewayApp::new(config).await?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    // Handle shutdown signals
    let app_clone = app.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, initiating graceful shutdown...");
                let _ = shutdown_tx.send(());
                if let Err(e) = app_clone.shutdown().await {
                    error!("Error during shutdown: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        }
    });

    // Run the application with shutdown handler
    app.run_with_shutdown(shutdown_rx).await?;

    info!("ln-gateway stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins over `logging.level`
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match config.logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.pretty().init(),
    }
}

/// Load configuration from file or use defaults
async fn load_config() -> Result<(Config, Option<PathBuf>)> {
    // Look for config in standard locations
    let config_paths = vec![
        PathBuf::from("./ln-gateway.toml"),
        PathBuf::from("/etc/ln-gateway/ln-gateway.toml"),
        dirs::config_dir()
            .map(|d| d.join("ln-gateway/ln-gateway.toml"))
            .unwrap_or_default(),
    ];

    for path in config_paths {
        if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let config: Config = toml::from_str(&content)?;
            return Ok((config, Some(path)));
        }
    }

    Ok((Config::default(), None))
}
