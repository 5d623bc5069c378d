use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use clap::Parser;
use log::{LevelFilter, info};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

mod actuator;
mod blink;
mod config;
mod gpio;
mod manager;
mod messages;
mod monitor;
mod mqtt;
mod scanner;
mod store;
mod trigger;

use config::{AppConfig, GpioBackendKind, ProbeBackend, Settings};
use gpio::{GpioBackend, SimulatedGpio, SysfsGpio};
use scanner::{BleAdvertisementProbe, HcitoolProbe, PresenceProbe};
use store::{ConfigStore, Persistence};

/// Gate a relay on the presence of known Bluetooth devices.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file; created with defaults if missing.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Use in-memory pins instead of real GPIO.
    #[arg(long)]
    simulate: bool,
}

async fn build_probe(
    backend: ProbeBackend,
    token: CancellationToken,
) -> anyhow::Result<Arc<dyn PresenceProbe>> {
    match backend {
        ProbeBackend::Hcitool => Ok(Arc::new(HcitoolProbe)),
        ProbeBackend::Ble => {
            let bt_manager = btleplug::platform::Manager::new().await?;
            // get the first bluetooth adapter
            let adapters = bt_manager.adapters().await?;
            let central = adapters
                .into_iter()
                .next()
                .context("no Bluetooth adapter found")?;
            Ok(Arc::new(BleAdvertisementProbe::start(central, token).await?))
        }
    }
}

fn cancel_on_signal(token: CancellationToken) -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            _ = terminate.recv() => info!("Terminated"),
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let config = AppConfig::load_or_create(&args.config)?;
    let settings = Settings::try_from(&config.settings)
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;

    info!("Devices: {:?}", settings.devices);

    let backend: Arc<dyn GpioBackend> = if args.simulate {
        Arc::new(SimulatedGpio::new())
    } else {
        match config.gpio.backend {
            GpioBackendKind::Simulated => Arc::new(SimulatedGpio::new()),
            GpioBackendKind::Sysfs => match &config.gpio.sysfs_root {
                Some(root) => Arc::new(SysfsGpio::new(root)),
                None => Arc::new(SysfsGpio::default()),
            },
        }
    };

    let token = CancellationToken::new();
    cancel_on_signal(token.clone())?;

    let probe = build_probe(config.probe.backend, token.clone()).await?;
    let mqtt = config.mqtt.as_ref().map(mqtt::MqttClient::new);
    let persistence = Persistence::new(args.config.clone(), config);
    let store = ConfigStore::open(settings, backend, Some(persistence))?;

    let mut core = manager::Manager::new(Arc::new(store), probe).watch_config(args.config);
    if let Some((mqtt_client, eventloop)) = mqtt {
        core = core.with_mqtt(mqtt_client, eventloop);
    }
    core.run_loop(token).await
}
