//! `router-bench`: exercises a [`litellm_router::Router`] against mocked
//! deployments (no real network calls) and reports basic latency/throughput
//! numbers, plus a small streaming demo.
//!
//! Grounded on the teacher's `admin.rs` CLI shape (`clap::Parser` +
//! `Subcommand`, `tracing_subscriber::fmt` initialized from a `--verbose`
//! flag) — generalized from NATS administration to Router load generation.

use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use litellm_router::config::{load_router_config, Credentials, DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
use litellm_router::providers::ProviderKind;
use litellm_router::types::{ChatMessage, NormalizedRequest};
use litellm_router::{Router, RouterOptions};
use tracing::info;

#[derive(Parser)]
#[command(name = "router-bench")]
#[command(about = "Exercises the Router against mocked deployments")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Optional router config file (TOML/JSON/YAML), layered under
    /// `ROUTER__*` environment variables
    #[arg(long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run N mocked completions through the Router and report latency stats
    Bench {
        /// Number of requests to issue
        #[arg(long, default_value_t = 1000)]
        requests: u64,

        /// Number of mocked deployments in the model group
        #[arg(long, default_value_t = 3)]
        deployments: u32,
    },

    /// Demonstrate the streaming aggregator against a mocked adapter-free
    /// router (requires a real provider adapter; prints an explanation if
    /// none is configured).
    Stream {
        /// Model group to request
        #[arg(long, default_value = "gpt-4")]
        model: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let router_config =
        load_router_config(cli.config.as_deref()).context("loading router config (file + ROUTER__* env vars)")?;

    match cli.command {
        Commands::Bench { requests, deployments } => run_bench(router_config, requests, deployments).await,
        Commands::Stream { model } => run_stream_demo(router_config, &model).await,
    }
}

async fn run_bench(config: litellm_router::RouterConfig, requests: u64, deployment_count: u32) -> Result<()> {
    let router = Router::new(RouterOptions {
        config,
        ..RouterOptions::default()
    });
    for i in 0..deployment_count {
        router.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: DeploymentParams {
                provider: ProviderKind::OpenAI,
                upstream_model: "gpt-4".to_string(),
                credentials: Credentials {
                    api_base: Some(format!("https://mock-{i}.invalid")),
                    api_key: Some("mock-key".to_string()),
                    ..Credentials::default()
                },
                ..DeploymentParams::default()
            },
            model_info: DeploymentModelInfo::default(),
        });
    }

    info!(requests, deployment_count, "starting bench run (mock_response, no network)");
    let started = Instant::now();
    let mut errors = 0u64;

    for _ in 0..requests {
        let mut request = NormalizedRequest::new("gpt-4", vec![ChatMessage::user("bench request")]);
        request.mock_response = Some("bench reply".to_string());
        if router.acompletion(request).await.is_err() {
            errors += 1;
        }
    }

    let elapsed = started.elapsed();
    let per_sec = requests as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        requests_per_sec = per_sec,
        errors,
        "bench run complete"
    );
    Ok(())
}

async fn run_stream_demo(config: litellm_router::RouterConfig, model: &str) -> Result<()> {
    let router = Router::new(RouterOptions {
        config,
        ..RouterOptions::default()
    });
    router.add_deployment(DeploymentConfigEntry {
        model_name: model.to_string(),
        litellm_params: DeploymentParams {
            provider: ProviderKind::OpenAI,
            upstream_model: model.to_string(),
            credentials: Credentials {
                api_base: Some("https://mock.invalid".to_string()),
                api_key: Some("mock-key".to_string()),
                ..Credentials::default()
            },
            ..DeploymentParams::default()
        },
        model_info: DeploymentModelInfo::default(),
    });

    info!(model, "streaming demo requires a live (or mock-server-backed) adapter; \
           mock_response only short-circuits the non-streaming path");
    let request = NormalizedRequest::new(model, vec![ChatMessage::user("stream this")]);
    match router.acompletion_stream(request).await {
        Ok(mut stream) => {
            while let Some(event) = stream.next().await {
                match event {
                    Ok(litellm_router::StreamEvent::Chunk(chunk)) => {
                        info!(?chunk, "chunk");
                    }
                    Ok(litellm_router::StreamEvent::End { usage, .. }) => {
                        info!(?usage, "stream complete");
                    }
                    Err(e) => {
                        info!(error = %e, "stream error");
                        break;
                    }
                }
            }
        }
        Err(e) => info!(error = %e, "could not open stream (expected without a live endpoint)"),
    }

    Ok(())
}
