use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use floodgate::config::{FloodgateConfig, LoggingConfig};
use floodgate::ratelimit::{RateLimiterService, RequestInfo};

#[derive(Parser)]
#[command(name = "floodgate")]
#[command(version, about = "Floodgate - in-memory request admission core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file; FLOODGATE__* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then print the effective policy
    Validate,

    /// Feed requests from one identity through the gate and print each decision
    Simulate {
        /// Client identity (usually the remote address)
        #[arg(long)]
        identity: String,

        /// Request path
        #[arg(long)]
        path: String,

        /// User-Agent header
        #[arg(long)]
        user_agent: Option<String>,

        /// Number of requests to send
        #[arg(long, default_value = "20")]
        count: u32,

        /// Pause between requests in milliseconds
        #[arg(long, default_value = "0")]
        interval_ms: u64,
    },

    /// Fire concurrent requests from random identities and print a summary
    Stress {
        /// Distinct identities to draw from
        #[arg(long, default_value = "100")]
        identities: usize,

        /// Total requests to send
        #[arg(long, default_value = "10000")]
        requests: usize,

        /// Paths to draw from
        #[arg(long, value_delimiter = ',', default_value = "/,/api/auth/login,/api/deploy")]
        paths: Vec<String>,
    },
}

/// Installs the tracing subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,floodgate={}", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        FloodgateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    init_logging(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Validate => validate(&config),
        Commands::Simulate {
            identity,
            path,
            user_agent,
            count,
            interval_ms,
        } => {
            let mut request = RequestInfo::new(identity, path);
            if let Some(user_agent) = user_agent {
                request = request.with_user_agent(user_agent);
            }
            simulate(config, request, count, Duration::from_millis(interval_ms)).await
        }
        Commands::Stress {
            identities,
            requests,
            paths,
        } => stress(config, identities, requests, paths).await,
    }
}

fn validate(config: &FloodgateConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&config.policy)?);
    info!(
        endpoint_overrides = config.policy.endpoint_overrides.len(),
        whitelist = config.policy.whitelist.len(),
        "Configuration is valid"
    );
    Ok(())
}

async fn simulate(
    config: FloodgateConfig,
    request: RequestInfo,
    count: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    let service = RateLimiterService::new(config)?;
    let reaper = service.start_reaper();

    let run = async {
        for _ in 0..count {
            let decision = service.check(&request);
            println!("{}", serde_json::to_string(&decision)?);
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
        Ok::<_, anyhow::Error>(())
    };

    tokio::select! {
        result = run => result?,
        _ = shutdown_signal() => warn!("Simulation interrupted"),
    }

    if let Some(reaper) = reaper {
        reaper.stop().await?;
    }
    info!(stats = ?service.stats(), "Simulation finished");
    Ok(())
}

async fn stress(
    config: FloodgateConfig,
    identities: usize,
    requests: usize,
    paths: Vec<String>,
) -> anyhow::Result<()> {
    anyhow::ensure!(identities > 0, "--identities must be greater than zero");
    anyhow::ensure!(!paths.is_empty(), "--paths must name at least one path");

    let service = Arc::new(RateLimiterService::new(config)?);
    let reaper = service.start_reaper();

    let workload: Vec<RequestInfo> = {
        let mut rng = rand::thread_rng();
        (0..requests)
            .map(|_| {
                let id = rng.gen_range(0..identities);
                let path = paths.choose(&mut rng).cloned().unwrap_or_default();
                let identity = format!("10.{}.{}.{}", (id >> 16) & 0xff, (id >> 8) & 0xff, id & 0xff);
                RequestInfo::new(identity, path)
            })
            .collect()
    };

    let started = Instant::now();
    let handles: Vec<_> = workload
        .into_iter()
        .map(|request| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.check(&request).allowed })
        })
        .collect();

    let mut failed = 0usize;
    for result in join_all(handles).await {
        if result.is_err() {
            failed += 1;
        }
    }
    let elapsed = started.elapsed();

    if let Some(reaper) = reaper {
        reaper.stop().await?;
    }

    let stats = service.stats();
    let summary = serde_json::json!({
        "instance": service.instance_id(),
        "requests": requests,
        "elapsed_ms": elapsed.as_millis() as u64,
        "failed_tasks": failed,
        "tracked_identities": service.registry().identity_count(),
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
