use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use log::{error, info};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::actuator::{ActuatorController, ActuatorError};
use crate::blink::BlinkScheduler;
use crate::config::{AppConfig, Settings, SettingsFile};
use crate::messages::PresenceState;
use crate::monitor::PresenceMonitor;
use crate::mqtt::MqttClient;
use crate::scanner::PresenceProbe;
use crate::store::{ConfigStore, ReloadError};
use crate::trigger::{self, EdgeDetector, ManualTrigger};

/// The handle outer surfaces (signals, MQTT) drive the system through.
#[derive(Clone)]
pub struct Controller {
    store: Arc<ConfigStore>,
    actuators: ActuatorController,
    presence: watch::Receiver<PresenceState>,
}

impl Controller {
    pub fn config(&self) -> Arc<Settings> {
        self.store.settings()
    }

    pub fn generation(&self) -> u64 {
        self.store.generation()
    }

    pub fn presence(&self) -> PresenceState {
        *self.presence.borrow()
    }

    pub async fn reload(&self, candidate: &SettingsFile) -> Result<(), ReloadError> {
        self.store.reload(candidate).await.map(|_| ()).map_err(|err| {
            error!("Configuration rejected: {}", err);
            err
        })
    }

    /// Pulses the relay regardless of presence.
    pub async fn trigger_relay_now(&self) -> Result<(), ActuatorError> {
        info!("Activating relay on request");
        self.actuators.pulse_relay().await
    }
}

/// Reads the hot-reloadable part of the configuration file at `path`.
fn read_settings(path: &Path) -> anyhow::Result<SettingsFile> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: AppConfig =
        toml::de::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config.settings)
}

async fn reload_from_file(controller: &Controller, path: &Path) {
    info!("Reloading configuration from {}", path.display());
    match read_settings(path) {
        Ok(candidate) => {
            // Rejections are logged by the controller.
            let _ = controller.reload(&candidate).await;
        }
        Err(err) => error!("Keeping current configuration: {:#}", err),
    }
}

async fn watch_hangup(
    controller: Controller,
    path: PathBuf,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let mut hangups = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = hangups.recv() => {
                if received.is_none() {
                    break;
                }
                reload_from_file(&controller, &path).await;
            }
        }
    }
    Ok(())
}

pub struct Manager {
    store: Arc<ConfigStore>,
    monitor: PresenceMonitor,
    mqtt: Option<(MqttClient, rumqttc::EventLoop)>,
    config_path: Option<PathBuf>,
}

impl Manager {
    pub fn new(store: Arc<ConfigStore>, probe: Arc<dyn PresenceProbe>) -> Self {
        Manager {
            monitor: PresenceMonitor::new(probe, store.clone()),
            store,
            mqtt: None,
            config_path: None,
        }
    }

    pub fn with_mqtt(mut self, client: MqttClient, eventloop: rumqttc::EventLoop) -> Self {
        self.mqtt = Some((client, eventloop));
        self
    }

    /// Re-read `path` and reload on SIGHUP.
    pub fn watch_config(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn controller(&self) -> Controller {
        Controller {
            store: self.store.clone(),
            actuators: ActuatorController::new(self.store.clone()),
            presence: self.monitor.state(),
        }
    }

    /// Runs every task until `token` is cancelled or one of them fails,
    /// then deactivates and releases all outputs.
    pub async fn run_loop(self, token: CancellationToken) -> anyhow::Result<()> {
        let controller = self.controller();
        let store = self.store.clone();
        let actuators = ActuatorController::new(store.clone());
        let (press_tx, press_rx) = trigger::press_channel();

        let mut tasks = JoinSet::new();
        tasks.spawn(named(
            "feedback",
            actuators.run_feedback(self.monitor.events(), token.clone()),
        ));
        tasks.spawn(named(
            "blink",
            BlinkScheduler::new(store.clone(), self.monitor.state()).run(token.clone()),
        ));
        tasks.spawn(named(
            "edge detector",
            EdgeDetector::new(store.clone(), press_tx).run(token.clone()),
        ));
        tasks.spawn(named(
            "manual trigger",
            ManualTrigger::new(store.clone(), self.monitor.state(), press_rx).run(token.clone()),
        ));
        if let Some((client, eventloop)) = self.mqtt {
            tasks.spawn(named(
                "mqtt",
                client.run(
                    eventloop,
                    self.monitor.events(),
                    controller.clone(),
                    token.clone(),
                ),
            ));
        }
        if let Some(path) = self.config_path {
            tasks.spawn(named(
                "reload",
                watch_hangup(controller.clone(), path, token.clone()),
            ));
        }
        tasks.spawn(named("monitor", self.monitor.run(token.clone())));

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((name, Err(err))) => err.context(format!("{} task failed", name)),
                Err(err) => anyhow::Error::new(err).context("task panicked"),
            };
            error!("{:#}, shutting down", failure);
            token.cancel();
            if result.is_ok() {
                result = Err(failure);
            }
        }

        info!("Exiting manager event loop");
        if let Err(err) = store.shutdown().await {
            if result.is_ok() {
                result = Err(err.into());
            }
        }
        result
    }
}

async fn named<F>(name: &'static str, task: F) -> (&'static str, anyhow::Result<()>)
where
    F: Future<Output = anyhow::Result<()>>,
{
    (name, task.await)
}
