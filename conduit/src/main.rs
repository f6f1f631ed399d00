#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use std::io::Read;
use std::path::Path;

use anyhow::Context as _;
use args::{Args, Command, InvokeArgs};
use clap::Parser;
use conduit_config::{Config, StoreConfig};
use conduit_core::{Channel, RequestIdentity, RequestPayload};
use conduit_workflow::{Engine, ResponseBody};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    match args.command {
        Command::Check => {
            check(&args.config, &config);
            Ok(())
        }
        Command::Invoke(invoke) => {
            let _telemetry_guard = conduit_telemetry::init(&config.telemetry, &args.log)?;
            tracing::info!(config_path = %args.config.display(), "starting conduit");
            run_invoke(&config, invoke).await
        }
    }
}

fn check(path: &Path, config: &Config) {
    let candidates: usize = config.routes.iter().map(|route| route.candidates.len()).sum();

    println!("{}: ok", path.display());
    let store = match &config.store {
        StoreConfig::Memory => "memory",
        StoreConfig::Redis(_) => "redis",
    };
    println!("  store: {store}");
    println!("  routes: {} ({candidates} candidates)", config.routes.len());
    for route in &config.routes {
        let ids: Vec<String> = route.candidates.iter().map(|c| c.resolved_id()).collect();
        println!("    {} {} -> {}", route.capability, route.model, ids.join(", "));
    }
    println!("  tenants: {}", config.billing.tenants.len());
    println!("  secrets: {}", config.secrets.len());
}

fn read_body(path: &Path) -> anyhow::Result<serde_json::Value> {
    let raw = if path == Path::new("-") {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read request body from stdin")?;
        raw
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
    };

    serde_json::from_str(&raw).context("request body is not valid JSON")
}

async fn run_invoke(config: &Config, args: InvokeArgs) -> anyhow::Result<()> {
    let body = read_body(&args.body)?;
    let engine = Engine::from_config(config).await?;

    let channel = if args.external { Channel::External } else { Channel::Internal };
    let mut identity = RequestIdentity::new(channel, args.capability);
    identity.tenant_id.clone_from(&args.tenant);
    identity.user_id.clone_from(&args.user);
    let trace_id = identity.trace_id.clone();

    let request = RequestPayload {
        model: args.model,
        body,
        stream: args.stream,
    };

    let response = match engine.execute(identity, request).await {
        Ok(response) => response,
        Err(failed) => {
            eprintln!("{}", serde_json::to_string_pretty(&failed.to_json())?);
            return Err(failed.into());
        }
    };

    tracing::info!(
        trace_id = %response.trace_id,
        candidate = response.upstream.candidate_id.as_deref().unwrap_or(""),
        status = response.status,
        retries = response.upstream.retry_count,
        "upstream responded"
    );

    match response.body {
        ResponseBody::Json(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            tracing::info!(
                trace_id = %response.trace_id,
                input_tokens = response.billing.input_tokens,
                output_tokens = response.billing.output_tokens,
                cost_micros = response.billing.cost_micros,
                "request finished"
            );
        }
        ResponseBody::Stream(mut stream) => {
            let mut stdout = tokio::io::stdout();
            let mut cancel_requested = false;

            loop {
                tokio::select! {
                    chunk = stream.next() => {
                        let Some(bytes) = chunk else { break };
                        stdout.write_all(&bytes).await?;
                        stdout.flush().await?;
                    }
                    signal = tokio::signal::ctrl_c(), if !cancel_requested => {
                        signal.context("failed to listen for Ctrl+C")?;
                        cancel_requested = true;
                        engine.cancel(args.capability, args.user.as_deref(), &trace_id).await?;
                    }
                }
            }

            tracing::info!(%trace_id, cancelled = cancel_requested, "stream finished");
        }
    }

    Ok(())
}
