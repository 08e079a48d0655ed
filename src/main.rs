// Azure CLI MCP Gateway - Main Entry Point
//
// Runs the stdio MCP server that exposes the Azure CLI as a tool, plus
// host-side helpers:
// - serve: stdio MCP server (default), optional HTTP status endpoint
// - exec: validate and run one command, print the structured result
// - check-config: load, validate and print the effective configuration

use anyhow::{Context, Result};
use azure_cli_mcp::config::Config;
use azure_cli_mcp::gateway::{CommandRequest, ToolGateway};
use azure_cli_mcp::mcp::McpServer;
use azure_cli_mcp::{logging, metrics, metrics_server};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// MCP server exposing the Azure CLI as a validated, authenticated tool
#[derive(Parser, Debug)]
#[command(name = "azure-cli-mcp")]
#[command(version)]
#[command(about = "MCP server exposing the Azure CLI as a tool", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve MCP over stdin/stdout (default)
    Serve {
        /// Also serve /health and /metrics on this local port
        #[arg(long)]
        http_port: Option<u16>,
    },
    /// Validate and run a single CLI command
    Exec {
        /// Confirm a destructive command
        #[arg(long)]
        confirm: bool,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// The command, e.g. `group list --output json`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Print the effective configuration with secrets hidden
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    logging::init(&config, args.verbose)?;

    match args.command {
        None => serve(config, None).await,
        Some(Commands::Serve { http_port }) => serve(config, http_port).await,
        Some(Commands::Exec {
            confirm,
            timeout,
            command,
        }) => exec(config, command, confirm, timeout).await,
        Some(Commands::CheckConfig) => check_config(&config),
    }
}

async fn serve(config: Config, http_port: Option<u16>) -> Result<()> {
    info!(
        "{} v{} starting (binary: {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.cli.binary
    );
    if let Err(e) = metrics::init() {
        error!("Failed to register metrics: {}", e);
    }

    let gateway = Arc::new(ToolGateway::from_config(&config)?);

    let port = http_port.or(config.http.enabled.then_some(config.http.port));
    if let Some(port) = port {
        let auth = gateway.auth().clone();
        let runner = gateway.runner();
        tokio::spawn(async move {
            if let Err(e) = metrics_server::start_status_server(port, auth, runner).await {
                error!("Status server stopped: {:#}", e);
            }
        });
    }

    McpServer::new(gateway).serve_stdio().await?;
    info!("Shutting down");
    Ok(())
}

async fn exec(config: Config, command: Vec<String>, confirm: bool, timeout: Option<u64>) -> Result<()> {
    let gateway = ToolGateway::from_config(&config)?;

    let mut request = CommandRequest::new(shell_words::join(&command));
    if confirm {
        request = request.confirmed();
    }
    if let Some(secs) = timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    let response = gateway.handle(request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if response.is_error() {
        std::process::exit(1);
    }
    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    let text = toml::to_string_pretty(&config.redacted()).context("Failed to render configuration")?;
    println!("{}", text);
    Ok(())
}
