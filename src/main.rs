use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use turnstile::config::TurnstileConfig;
use turnstile::engine::Engine;
use turnstile::ratelimit::RateLimitKey;

/// Multi-tier request admission engine.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// YAML configuration file; defaults and TURNSTILE__* overrides apply without one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load the configuration, validate every tier and print the effective settings
    Validate,
    /// Send requests for one key through the configured limiter
    Simulate {
        /// Rate limit key, e.g. `user:42` or `ip:203.0.113.9`
        #[arg(long)]
        key: String,

        /// Number of admission checks to run
        #[arg(long, default_value_t = 1)]
        requests: u32,

        /// Pause between checks
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => TurnstileConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => TurnstileConfig::from_env().context("failed to load configuration")?,
    };

    match cli.command {
        Command::Validate => validate(&config),
        Command::Simulate {
            key,
            requests,
            interval_ms,
        } => {
            let interval = Duration::from_millis(interval_ms);
            simulate(config, RateLimitKey::new(key), requests, interval).await
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    // Logs go to stderr so stdout stays machine readable
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn validate(config: &TurnstileConfig) -> anyhow::Result<()> {
    let policies = config.build_policies()?;
    config.keys.to_deriver()?;

    info!(
        topology = ?config.limits.topology,
        backend = ?config.store.backend,
        tiers = policies.len(),
        "Configuration is valid"
    );
    // Effective configuration, defaults and environment overrides applied
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

async fn simulate(
    config: TurnstileConfig,
    key: RateLimitKey,
    requests: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    let engine = Engine::from_config(config).await?;
    info!(key = %key, requests = requests, "Simulating requests");

    let mut admitted = 0u32;
    let mut failed = 0u32;
    for i in 0..requests {
        if i > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }

        match engine.admit(&key).await {
            Ok(decision) => {
                admitted += u32::from(decision.allowed);
                println!("{}", serde_json::to_string(&decision)?);
            }
            Err(e) => {
                failed += 1;
                warn!(key = %key, attempt = i + 1, error = %e, "Admission check failed");
            }
        }
    }

    info!(
        admitted = admitted,
        denied = requests - admitted - failed,
        failed = failed,
        "Simulation finished"
    );
    Ok(())
}
