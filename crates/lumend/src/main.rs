use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lumend::Config;
use lumend::ConfigError;
use lumend::Engine;
use lumend::discovery::SsdpDiscovery;
use lumend::engine::Collaborators;
use lumend::engine::EngineSettings;
use lumend::fixture::yeelight::YeelightConnector;
use lumend::probe::PingProbe;
use lumend::routine::SchedulerSettings;
use lumend::store::JsonFileStore;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Home lighting daemon
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "lumend.toml")]
    config: PathBuf,

    /// Skip network discovery at startup
    #[arg(long)]
    no_scan: bool,
}

fn init_logging(config: &Config) {
    let filter = Targets::new()
        .with_default(LevelFilter::from(config.logging.level))
        .with_targets(
            config
                .logging
                .overrides
                .iter()
                .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
        );

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (config, found) = match Config::from_file(&args.config) {
        Ok(config) => (config, true),
        Err(ConfigError::Io(_, e)) if e.kind() == std::io::ErrorKind::NotFound => {
            (Config::default(), false)
        }
        Err(e) => {
            return Err(e).with_context(|| format!("loading {}", args.config.display()));
        }
    };

    init_logging(&config);
    info!("lumend {} starting", env!("CARGO_PKG_VERSION"));
    if found {
        info!("Loaded config from: {}", args.config.display());
    } else {
        warn!("No config at {}, using defaults", args.config.display());
    }

    let store = JsonFileStore::open(&config.system.data_dir)
        .await
        .with_context(|| format!("opening data dir {}", config.system.data_dir.display()))?;

    let command_timeout = config.fixtures.command_timeout();
    let engine = Engine::load(
        Collaborators {
            store: Arc::new(store),
            connector: Arc::new(YeelightConnector::new(
                config.fixtures.port,
                config.fixtures.transition(),
            )),
            discovery: Arc::new(SsdpDiscovery::new(config.discovery.timeout())),
            probe: Arc::new(PingProbe::new(config.presence.probe_timeout())),
        },
        EngineSettings {
            command_timeout,
            probe_timeout: config.presence.probe_timeout(),
            routines: SchedulerSettings {
                step_interval: config.routines.step_interval(),
                // a cancelled step may still be sending power, brightness and ct
                stop_wait: command_timeout * 3,
            },
        },
    )
    .await
    .context("loading documents")?;
    let engine = Arc::new(engine);

    if config.discovery.scan_on_start && !args.no_scan {
        if let Err(e) = engine.reconcile_now().await {
            error!("Startup scan failed, keeping the stored registry: {}", e);
        }
    }

    let monitor = engine.presence().clone().spawn();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        shutdown_tx.send(()).ok();
    });

    let served = if config.api.enabled {
        lumend::api::serve(
            engine.clone(),
            config.api.listen.clone(),
            config.api.port,
            shutdown_rx,
        )
        .await
        .map_err(|e| anyhow::anyhow!("HTTP API failed: {}", e))
    } else {
        info!("HTTP API disabled, press Ctrl+C to exit");
        shutdown_rx.await.ok();
        Ok(())
    };

    monitor.stop().await;
    info!("lumend shutdown complete");

    served
}
