use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cybersight_engine::{
    config::Config,
    dataset::{load_dataset, synthetic},
    engine::ThreatEngine,
    routes::{build_router, AppState},
    trainer::Trainer,
    types::BatchItem,
};

#[derive(Parser)]
#[command(name = "cybersight", version, about = "URL threat classification engine")]
struct Args {
    /// TOML configuration file; `cybersight.toml` is picked up when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Train candidate models and persist the best one
    Train {
        #[arg(long, conflicts_with = "synthetic", required_unless_present = "synthetic")]
        dataset: Option<PathBuf>,
        /// Generate N labeled URLs instead of reading a dataset
        #[arg(long)]
        synthetic: Option<usize>,
        /// Seeds the split, the models and synthetic data; overrides `training.seed`
        #[arg(long)]
        seed: Option<u64>,
        /// Artifact path; defaults to the configured one
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Classify URLs and print verdicts as JSON
    Classify {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cybersight_engine=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    match args.command {
        Command::Serve { bind } => serve(config, bind).await,
        Command::Train {
            dataset,
            synthetic: count,
            seed,
            out,
        } => train(with_seed(config, seed), dataset, count, out),
        Command::Classify { urls } => classify(config, &urls),
        Command::PrintConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: Config, bind: Option<String>) -> Result<()> {
    let engine = Arc::new(ThreatEngine::new(&config)?);

    let metrics = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus recorder not installed: {}", e);
            None
        }
    };

    let app = build_router(AppState::new(engine, metrics));

    let bind = bind.unwrap_or(config.server.bind_addr);
    let addr: SocketAddr = bind.parse().with_context(|| format!("invalid bind address {}", bind))?;
    info!("Starting Cyber-Sight threat engine on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn with_seed(mut config: Config, seed: Option<u64>) -> Config {
    if let Some(seed) = seed {
        config.training.seed = seed;
    }
    config
}

fn train(
    config: Config,
    dataset: Option<PathBuf>,
    synthetic_count: Option<usize>,
    out: Option<PathBuf>,
) -> Result<()> {
    let (examples, skipped) = match (dataset, synthetic_count) {
        (Some(path), _) => {
            let dataset = load_dataset(&path).with_context(|| format!("reading {}", path.display()))?;
            (dataset.examples, dataset.skipped)
        }
        (None, Some(count)) => (synthetic(count, config.training.seed), 0),
        (None, None) => bail!("either --dataset or --synthetic is required"),
    };

    let artifact_path = out.unwrap_or_else(|| config.model.artifact_path.clone());
    let trainer = Trainer::new(&config)?;
    let outcome = trainer.train_and_save(&examples, skipped, &artifact_path)?;

    println!("{}", outcome.report.to_text());
    info!("Model artifact written to {}", artifact_path.display());
    Ok(())
}

fn classify(config: Config, urls: &[String]) -> Result<()> {
    let engine = ThreatEngine::new(&config)?;
    let items = engine.classify_batch(urls);
    let failed = items.iter().filter(|i| i.is_error()).count();

    let output = match items.as_slice() {
        [BatchItem::Ok { verdict }] => serde_json::to_string_pretty(verdict)?,
        _ => serde_json::to_string_pretty(&items)?,
    };
    println!("{}", output);

    if failed > 0 {
        bail!("{} of {} URLs could not be classified", failed, urls.len());
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_flag_reaches_training_config() {
        let args = Args::try_parse_from(["cybersight", "train", "--synthetic", "50", "--seed", "7"]).unwrap();
        let Command::Train { seed, .. } = args.command else {
            panic!("expected train command");
        };
        assert_eq!(with_seed(Config::default(), seed).training.seed, 7);
    }

    #[test]
    fn test_missing_seed_keeps_configured_one() {
        let args = Args::try_parse_from(["cybersight", "train", "--synthetic", "50"]).unwrap();
        let Command::Train { seed, .. } = args.command else {
            panic!("expected train command");
        };
        let mut config = Config::default();
        config.training.seed = 11;
        assert_eq!(with_seed(config, seed).training.seed, 11);
    }
}
