//! Logging Setup
//!
//! Logs always go to stderr or a file. stdout carries the MCP protocol and
//! must never receive a log line.

use crate::config::Config;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

type BoxedSubscriber = Box<dyn Subscriber + Send + Sync>;

/// Build the filter: `RUST_LOG` wins, then the configured level
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber
pub fn init(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = env_filter(&level.to_string().to_lowercase());
    let config = &config.logging;

    let subscriber = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            build_subscriber(&config.format, filter, Mutex::new(file))
        }
        None => build_subscriber(&config.format, filter, std::io::stderr),
    };
    subscriber
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

/// Formatting subscriber for one of the configured formats
fn build_subscriber<W>(format: &str, filter: EnvFilter, writer: W) -> BoxedSubscriber
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer);

    match format {
        "json" => Box::new(builder.json().finish()),
        "pretty" => Box::new(builder.pretty().finish()),
        "compact" => Box::new(builder.compact().finish()),
        _ => Box::new(builder.finish()),
    }
}
