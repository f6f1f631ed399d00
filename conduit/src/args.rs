use std::path::PathBuf;

use clap::{Parser, Subcommand};
use conduit_core::Capability;

/// Conduit gateway engine
#[derive(Debug, Parser)]
#[command(name = "conduit", about = "LLM gateway execution engine: routing, upstream calls and metering")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "conduit.toml", env = "CONDUIT_CONFIG", global = true)]
    pub config: PathBuf,

    /// Log filter, in `tracing` env-filter syntax
    #[arg(long, default_value = "info", env = "CONDUIT_LOG", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate the configuration and print a summary
    Check,
    /// Run one request through the pipeline and print the response
    Invoke(InvokeArgs),
}

#[derive(Debug, clap::Args)]
pub struct InvokeArgs {
    #[arg(long, default_value = "chat", value_parser = parse_capability)]
    pub capability: Capability,

    /// Public model alias
    #[arg(long)]
    pub model: String,

    /// Tenant to bill, unmetered when absent
    #[arg(long)]
    pub tenant: Option<String>,

    #[arg(long)]
    pub user: Option<String>,

    /// JSON request body, `-` for stdin
    #[arg(long)]
    pub body: PathBuf,

    /// Stream the response as server-sent events
    #[arg(long)]
    pub stream: bool,

    /// Treat the request as external tenant traffic
    #[arg(long)]
    pub external: bool,
}

fn parse_capability(raw: &str) -> Result<Capability, String> {
    Capability::parse(raw).ok_or_else(|| {
        let known: Vec<&str> = Capability::ALL.iter().map(|c| c.as_str()).collect();
        format!("unknown capability '{raw}', expected one of: {}", known.join(", "))
    })
}
