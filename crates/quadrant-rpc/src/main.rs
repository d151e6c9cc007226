//! Quadrant RPC Server - serves the example Greeting and Todo services.

use anyhow::Result;
use clap::Parser;
use quadrant_core::ServerConfig;
use std::time::Duration;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "quadrant-rpc")]
#[command(about = "Example Quadrant RPC server")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Delay between letters of the StreamedName subscription, in milliseconds
    #[arg(long, default_value_t = quadrant_rpc::DEFAULT_STREAM_DELAY.as_millis() as u64)]
    stream_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG overrides the --debug level
    let log_level = if args.debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Quadrant RPC Server");

    let config = ServerConfig::new(&args.host, args.port);
    let app = quadrant_rpc::start_server(&config, Duration::from_millis(args.stream_delay_ms)).await?;

    // Print port for the launching process to read (intentional stdout)
    println!("RPC_PORT={}", app.addr().port());

    info!("RPC server running on {}", app.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    app.shutdown().await;

    Ok(())
}
