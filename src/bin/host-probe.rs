//! Loopback client for exercising the host from a terminal.
//!
//! Spawns the host binary, runs the handshake over its stdio, and issues
//! one request: the same traffic the browser extension generates, minus
//! the browser.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use fabric_native_host::client::{BridgeConnection, BridgeEvent};
use fabric_native_host::transport::ResponsePayload;

#[derive(Parser, Debug)]
#[command(name = "host-probe")]
#[command(about = "Exercise the native messaging host from the command line")]
struct Args {
    /// Path to the fabric-native-host binary
    #[arg(long, default_value = "fabric-native-host")]
    host: PathBuf,

    /// fabric-ai executable override sent with every request
    #[arg(long)]
    tool: Option<PathBuf>,

    #[command(subcommand)]
    command: ProbeCommand,
}

#[derive(Subcommand, Debug)]
enum ProbeCommand {
    /// Run the handshake and report the tool's path and version
    Ping,
    /// List available patterns
    Patterns,
    /// List available contexts
    Contexts,
    /// Stream stdin through the tool
    Process {
        #[arg(long)]
        pattern: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        context: Option<String>,
        /// Free-form prompt, used when no pattern is given
        #[arg(long)]
        prompt: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut host = Command::new(&args.host)
        .arg("--stdio")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn host: {}", args.host.display()))?;

    let host_stdin = host.stdin.take().context("host stdin unavailable")?;
    let host_stdout = host.stdout.take().context("host stdout unavailable")?;

    let mut connection = BridgeConnection::new(args.tool, std::time::Duration::from_secs(10));
    let handshake = connection.connect(host_stdout, host_stdin).await?;
    eprintln!(
        "connected: tool {} version {}",
        handshake.resolved_path.as_deref().unwrap_or("(unknown)"),
        handshake.version.as_deref().unwrap_or("(unknown)")
    );

    match args.command {
        ProbeCommand::Ping => {
            // The handshake above already proved the tool out.
            println!("tool is valid");
        }
        ProbeCommand::Patterns => {
            let response = connection.list_patterns().await?.await??;
            match response.payload {
                ResponsePayload::PatternsList { patterns } => {
                    for pattern in patterns {
                        println!("{pattern}");
                    }
                }
                ResponsePayload::Error { message } => anyhow::bail!(message),
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
        ProbeCommand::Contexts => {
            let response = connection.list_contexts().await?.await??;
            match response.payload {
                ResponsePayload::ContextsList { contexts } => {
                    for context in contexts {
                        println!("{context}");
                    }
                }
                ResponsePayload::Error { message } => anyhow::bail!(message),
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
        ProbeCommand::Process {
            pattern,
            model,
            context,
            prompt,
        } => {
            let mut content = String::new();
            tokio::io::stdin()
                .read_to_string(&mut content)
                .await
                .context("failed to read stdin")?;

            let mut events = connection.subscribe();
            let (id, mut receiver) = connection
                .process_content(content, model, pattern, context, prompt)
                .await?;

            loop {
                tokio::select! {
                    // Drain queued content before looking at the terminal
                    // frame; the host always emits content first.
                    biased;

                    event = events.recv() => {
                        if let Ok(BridgeEvent::Content { id: event_id, content }) = event {
                            if event_id == id {
                                println!("{content}");
                            }
                        }
                    }
                    terminal = &mut receiver => {
                        let response = terminal.context("host went away")??;
                        match response.payload {
                            ResponsePayload::Done { exit_code } => {
                                eprintln!("done (exit code {exit_code:?})");
                            }
                            ResponsePayload::Error { message } => anyhow::bail!(message),
                            ResponsePayload::Cancelled { .. } => eprintln!("cancelled"),
                            other => anyhow::bail!("unexpected response: {other:?}"),
                        }
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
