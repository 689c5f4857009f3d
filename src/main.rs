use depthsync::orderbook::TraceSink;
use depthsync::{AppConfig, OrderbookManager};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_args(&args);

    tracing::info!(config = %config_path, "starting depthsync");
    let config = AppConfig::load(&config_path)?;

    // The JetStream publisher plugs in here; the trace sink stands in when
    // no bus is configured.
    let sink = Arc::new(TraceSink::default());
    let manager = OrderbookManager::start(&config, sink.clone()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    manager.stop().await;
    tracing::info!(delivered = sink.delivered(), "exited cleanly");
    Ok(())
}

/// Parse command-line arguments
fn parse_args(args: &[String]) -> String {
    let mut config_path = "depthsync.toml".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config_path
}

/// Print usage information
fn print_usage() {
    println!("depthsync - multi-exchange orderbook synchronization core");
    println!();
    println!("USAGE:");
    println!("    depthsync [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config, -c <PATH>   Config file path (default: depthsync.toml)");
    println!("    --help, -h            Print this help message");
    println!();
    println!("ENVIRONMENT VARIABLES:");
    println!("    BINANCE_API_KEY / BINANCE_API_SECRET    Optional Binance credentials");
    println!("    OKX_API_KEY / OKX_API_SECRET            Optional OKX credentials");
    println!("    DERIBIT_API_KEY / DERIBIT_API_SECRET    Optional Deribit credentials");
    println!("    RUST_LOG                                Logging level (default: info)");
}
