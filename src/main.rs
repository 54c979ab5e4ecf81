//! miniprogram-mcp - MCP server for WeChat Mini Program DevTools automation.
//!
//! This binary exposes a running Mini Program to AI assistants and other MCP
//! clients over stdio.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wechat_miniprogram_mcp::{ConnectConfig, McpServer};

/// MCP server for WeChat Mini Program DevTools automation.
#[derive(Parser, Debug)]
#[command(name = "miniprogram-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Full automation endpoint, e.g. ws://127.0.0.1:9420.
    /// Overrides --port when set.
    #[arg(long)]
    ws_endpoint: Option<String>,

    /// Automation port on localhost (default: WECHAT_DEVTOOLS_WS_PORT
    /// environment variable, then 9420).
    #[arg(long)]
    port: Option<u16>,

    /// Default timeout in milliseconds for connection establishment and
    /// automation calls.
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Log to stderr (not stdout, which is used for MCP protocol)
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(
        "Starting {} v{}",
        wechat_miniprogram_mcp::server::SERVER_NAME,
        wechat_miniprogram_mcp::server::SERVER_VERSION
    );

    let config = ConnectConfig::from_flags(
        args.ws_endpoint,
        args.port,
        Duration::from_millis(args.timeout_ms),
    );
    tracing::info!("Automation endpoint: {}", config.ws_endpoint);

    let server = McpServer::new(config);

    match server.run_stdio().await {
        Ok(()) => {
            tracing::info!("Server exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
