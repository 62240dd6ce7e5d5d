use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use revline_core::config::RevlineConfig;
use revline_core::demo::{DemoAdapter, DEMO_DEVICE_ID};
use revline_core::protocol::{event_channel, AdapterSession, ByteTransport, SerialTransport};
use revline_core::sound::{EngineSoundProfile, LayerKey, LevelsBackend, SoundEngine};
use revline_core::store::{DeviceMemory, MemoryStore};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "revline-demo",
    about = "Drive the engine sound model from a simulated or serial OBD adapter"
)]
struct Cli {
    /// How long to run
    #[arg(long, default_value_t = 10)]
    seconds: u64,
    /// Engine sound profile (overrides the config file)
    #[arg(long)]
    profile: Option<String>,
    /// Config file (defaults to the user config location)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Serial port of a real adapter instead of the simulator
    #[arg(long)]
    port: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: {err:?}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(Cli::parse())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<RevlineConfig> {
    let path = match path {
        Some(path) => path,
        None => RevlineConfig::default_path().context("locating config directory")?,
    };
    let config = RevlineConfig::load_or_default(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config)?;
    if let Some(profile) = cli.profile {
        config.profile = profile;
    }

    let profile = EngineSoundProfile::builtin(&config.profile)
        .ok_or_else(|| anyhow!("unknown profile '{}'", config.profile))?;

    let (events_tx, events_rx) = event_channel();
    let (transport, device_id): (Arc<dyn ByteTransport>, String) = match cli.port {
        Some(port) => (
            Arc::new(SerialTransport::new(config.adapter.baud_rate, events_tx)),
            port,
        ),
        None => (
            Arc::new(DemoAdapter::new(events_tx)),
            DEMO_DEVICE_ID.to_string(),
        ),
    };

    let memory = DeviceMemory::new(Arc::new(MemoryStore::new()));
    let session = AdapterSession::new(config.adapter.clone(), &config.signal, transport, Some(memory));
    session.attach(events_rx);

    let backend = Arc::new(LevelsBackend::new());
    let engine = Arc::new(SoundEngine::new(&config.modulation, profile, backend.clone()));
    let cancel = CancellationToken::new();
    let ticker = engine.spawn(session.signal(), cancel.clone());

    session.connect(&device_id)?;
    info!("Running '{}' for {}s", config.profile, cli.seconds);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.seconds);
    let mut report = tokio::time::interval(Duration::from_millis(500));
    while tokio::time::Instant::now() < deadline {
        report.tick().await;
        let snapshot = session.snapshot();
        let levels = backend.levels();
        info!(
            "{:<13} rpm {:>6.0} thr {:.2} | on-lo {:.2} off-lo {:.2} on-hi {:.2} off-hi {:.2} lim {:.2}",
            snapshot.state.to_string(),
            snapshot.rpm,
            snapshot.throttle,
            levels.gain(LayerKey::OnLow),
            levels.gain(LayerKey::OffLow),
            levels.gain(LayerKey::OnHigh),
            levels.gain(LayerKey::OffHigh),
            levels.gain(LayerKey::Limiter),
        );
    }

    session.disconnect();
    cancel.cancel();
    ticker.await.context("modulation loop")?;

    let stats = session.channel_stats();
    info!(
        "{} commands, {} responses, {} timeouts",
        stats.commands, stats.responses, stats.timeouts
    );
    Ok(())
}
