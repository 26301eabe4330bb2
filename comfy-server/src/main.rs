use std::sync::Arc;

use clap::Parser;
use comfy_core::{ComfyConfig, CompletionBackend};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use comfy_server::http::{start_http_server, HttpState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "comfy.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match ComfyConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level)),
        )
        .init();

    let store = match comfy_core::create_store(&config.database).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open {} store: {}", config.database.backend, e);
            std::process::exit(1);
        }
    };

    if args.health {
        match store.health().await {
            Ok(v) => println!("✅ {} store ready: {}", store.name(), v),
            Err(e) => {
                println!("❌ {} store check failed: {}", store.name(), e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let completion: Arc<dyn CompletionBackend> = match comfy_core::create_backend(&config.completion) {
        Ok(b) => Arc::from(b),
        Err(e) => {
            eprintln!("Failed to create completion client: {}", e);
            std::process::exit(1);
        }
    };

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tracing::info!(
        store = store.name(),
        model = %config.completion.model,
        "Starting Comfy server"
    );

    let state = HttpState {
        store,
        completion,
        config,
    };
    start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
