//! tandem: run a broker or make a one-off call against one.

#![deny(unsafe_code)]

mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tandem_core::HandlerError;
use tandem_core::logging::{init_subscriber, parse_level};
use tandem_ws::{Broker, BrokerOptions, Client, ClientError, LifecycleHooks};
use tracing::info;

use crate::settings::{TandemSettings, load_settings};

/// Bidirectional RPC over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "tandem", version, about)]
struct Cli {
    /// Settings file (defaults to ~/.tandem/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a broker exposing `echo` and `peers` until Ctrl-C.
    Serve {
        /// Host to bind.
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (0 picks a free port).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect to a broker, invoke one operation and print the result.
    Call {
        /// Broker URL, e.g. ws://127.0.0.1:9847.
        url: String,
        /// Operation name.
        name: String,
        /// Positional arguments; each is parsed as JSON, else taken as a string.
        args: Vec<String>,
        /// Keep dialing (every `client.reconnect_backoff_ms`) until the
        /// broker is reachable.
        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(raw) = &cli.log_level {
        let level = parse_level(raw).with_context(|| format!("unknown log level {raw:?}"))?;
        settings.log_level = level.to_owned();
    }
    init_subscriber(&settings.log_level);

    match cli.command {
        Command::Serve { host, port } => serve(settings, host, port).await,
        Command::Call {
            url,
            name,
            args,
            wait,
        } => call(&settings, &url, &name, args, wait).await,
    }
}

async fn serve(
    mut settings: TandemSettings,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        settings.broker.host = host;
    }
    if let Some(port) = port {
        settings.broker.port = port;
    }

    let live = Arc::new(AtomicUsize::new(0));
    let opened = Arc::clone(&live);
    let closed = Arc::clone(&live);
    let hooks = LifecycleHooks::new()
        .on_open(move |_| {
            let _ = opened.fetch_add(1, Ordering::Relaxed);
        })
        .on_close(move |_, _| {
            let _ = closed.fetch_sub(1, Ordering::Relaxed);
        });

    let broker = Broker::create(BrokerOptions::new(settings.broker).with_hooks(hooks))
        .await
        .context("failed to start broker")?;

    let _ = broker.on_call("echo", echo);
    let counter = Arc::clone(&live);
    let _ = broker.on_call("peers", move |_args: Vec<Value>| {
        let count = counter.load(Ordering::Relaxed);
        async move { Ok::<_, HandlerError>(Value::from(count)) }
    });

    info!(url = %broker.url(), "broker listening");
    println!("{}", broker.url());

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");
    broker.close().await;
    Ok(())
}

async fn call(
    settings: &TandemSettings,
    url: &str,
    name: &str,
    args: Vec<String>,
    wait: bool,
) -> anyhow::Result<()> {
    let args: Vec<Value> = args.iter().map(|raw| parse_arg(raw)).collect();
    let client = Client::new(settings.client.clone());

    let invoke = |endpoint: tandem_core::Endpoint| {
        let args = args.clone();
        async move {
            let response = endpoint.call(name, args).await?;
            endpoint.close();
            Ok::<_, ClientError>(response)
        }
    };
    let response = if wait {
        let backoff = settings.client.reconnect_backoff();
        client.auto_reconnect(url, invoke, backoff).await
    } else {
        client.connect(url, invoke).await
    }
    .with_context(|| format!("call {name:?} on {url} failed"))?;

    let rendered = match response {
        Some(value) => serde_json::to_string_pretty(&value)?,
        None => "null".to_owned(),
    };
    println!("{rendered}");
    Ok(())
}

async fn echo(args: Vec<Value>) -> Result<Value, HandlerError> {
    Ok(args.into_iter().next().unwrap_or(Value::Null))
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}
