use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jrpcd::config::ServerConfig;
use jrpcd::logging::{self, LogConfig};
use jrpcd::rpc::{FaultPolicy, JsonRpcServer, RpcClient, builtin::builtin_methods};
use serde::Serialize;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "jrpcd")]
#[command(about = "JSON-RPC over HTTP POST and WebSocket", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./jrpcd.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server with the built-in methods
    Serve(ServerArgs),
    /// Send one request to a running server
    Call(CallArgs),
    /// Print the effective configuration as TOML
    Config(ServerArgs),
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    post_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    ws_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    fault_policy: Option<FaultPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_body_bytes: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct CallArgs {
    /// Method name
    method: String,

    /// Params as a JSON document
    params: Option<String>,

    /// POST route URL (defaults to the configured address)
    #[arg(long)]
    url: Option<String>,

    /// Send as a notification (no id, no reply)
    #[arg(long)]
    notify: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match &cli.command {
        Commands::Serve(args) => {
            let config = ServerConfig::load(config_path, Some(args))?;
            logging::init(LogConfig::from(&config)).context("Failed to initialise logging")?;
            run_server(config).await.context("Failed to run server")?
        }
        Commands::Call(args) => {
            let config = ServerConfig::load::<ServerArgs>(config_path, None)?;
            run_call(&config, args).await?
        }
        Commands::Config(args) => {
            let config = ServerConfig::load(config_path, Some(args))?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = Arc::new(JsonRpcServer::new(&config, Arc::new(builtin_methods())));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            signal_server.shutdown();
        }
    });

    tracing::info!(
        post = %config.post_url(),
        ws = %format!("ws://{}{}", config.bind_addr(), config.ws_path),
        "Starting JSON-RPC server"
    );
    server.start().await
}

async fn run_call(config: &ServerConfig, args: &CallArgs) -> Result<()> {
    let params = args
        .params
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("Params must be valid JSON")?;

    let client = RpcClient::new(args.url.clone().unwrap_or_else(|| config.post_url()));

    if args.notify {
        client
            .notify(&args.method, params)
            .await
            .context("Failed to send notification")?;
        return Ok(());
    }

    let result: Value = client
        .call(&args.method, params)
        .await
        .with_context(|| format!("Call to {} failed", client.url()))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
