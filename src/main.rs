//! fabric-native-host
//!
//! Native messaging host for the fabric browser extension. Speaks
//! length-prefixed JSON over stdio and dispatches requests to supervised
//! fabric-ai invocations.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fabric_native_host::{config::Settings, router};

#[derive(Parser, Debug)]
#[command(name = "fabric-native-host")]
#[command(about = "Native messaging host bridging a browser extension to fabric-ai")]
struct Args {
    /// Run in stdio mode (how browsers launch native messaging hosts)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logging goes to stderr; stdout carries protocol frames.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env();
    info!(
        tool_path = ?settings.tool_path,
        handshake_timeout = ?settings.handshake_timeout,
        "loaded configuration"
    );

    if args.stdio {
        router::serve_stdio(settings)
            .await
            .context("transport failure")?;
    } else {
        anyhow::bail!("only --stdio mode is supported");
    }

    Ok(())
}
