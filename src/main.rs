use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use linewatch::agent::Agent;
use linewatch::config::Config;
use linewatch::store::MemoryStore;

/// Real-time machine telemetry pipeline.
#[derive(Parser)]
#[command(name = "linewatch", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("linewatch {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Without a file every setting takes its default.
    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    if let Some(Command::CheckConfig) = &cli.command {
        println!("configuration ok");
        return Ok(());
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting linewatch",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let store = Arc::new(MemoryStore::new(cfg.store.retention));
    let source = broker::source(&cfg)?;

    let mut agent = Agent::new(cfg, store, source)?;
    agent.start().await?;

    // Run until a signal arrives or the consumer gives up.
    let done = agent.done();
    tokio::select! {
        _ = shutdown_rx => {}
        _ = done.cancelled() => {
            tracing::warn!("pipeline stopped consuming, shutting down");
        }
    }

    agent.stop().await?;

    tracing::info!("linewatch stopped");

    Ok(())
}

#[cfg(feature = "kafka")]
mod broker {
    use anyhow::{Context, Result};
    use linewatch::config::Config;
    use linewatch::consumer::kafka::KafkaSource;

    pub fn source(cfg: &Config) -> Result<KafkaSource> {
        KafkaSource::new(&cfg.broker).context("creating kafka consumer")
    }
}

#[cfg(not(feature = "kafka"))]
mod broker {
    use anyhow::{bail, Result};
    use linewatch::config::Config;
    use linewatch::consumer::ChannelSource;

    pub fn source(_cfg: &Config) -> Result<ChannelSource> {
        bail!("built without kafka support; rebuild with `--features kafka`")
    }
}
