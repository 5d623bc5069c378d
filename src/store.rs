//! The active configuration and the pin bindings derived from it.
//!
//! Both live behind one `RwLock`. Every task takes the read side for the
//! duration of an operation that touches a binding and looks the binding up
//! again on each use; a reload takes the write side, so it waits for
//! in-flight pulses and beeps and holds new ones back until the new
//! bindings are in place. Nothing outside this module keeps a line across
//! lock acquisitions, so a released line is never reached.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, info, warn};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, watch};

use crate::config::{AppConfig, PinLayout, Settings, SettingsFile, ValidationErrors};
use crate::gpio::{GpioBackend, GpioError, InputLine, OutputLine};

pub struct Bindings {
    pub indicator: Mutex<OutputLine>,
    pub relay: Mutex<OutputLine>,
    pub buzzer: Mutex<OutputLine>,
    pub trigger: Mutex<InputLine>,
}

#[derive(Debug, Error)]
#[error("pin bindings have been released")]
pub struct Released;

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Invalid(#[from] ValidationErrors),
    #[error("failed to bind {role}: {source}")]
    Binding {
        role: &'static str,
        #[source]
        source: GpioError,
    },
    #[error("shutting down")]
    ShutDown,
}

/// What a reader sees: one consistent configuration generation.
pub struct Active {
    pub settings: Arc<Settings>,
    pub generation: u64,
    bindings: Option<Bindings>,
}

impl Active {
    pub fn bindings(&self) -> Result<&Bindings, Released> {
        self.bindings.as_ref().ok_or(Released)
    }
}

/// Where successful reloads are written back to.
pub struct Persistence {
    pub path: PathBuf,
    pub document: AppConfig,
    /// Generation last written; an older one never overwrites it.
    written: std::sync::Mutex<u64>,
}

impl Persistence {
    pub fn new(path: PathBuf, document: AppConfig) -> Self {
        Persistence {
            path,
            document,
            written: std::sync::Mutex::new(0),
        }
    }
}

pub struct ConfigStore {
    backend: Arc<dyn GpioBackend>,
    active: RwLock<Active>,
    settings_tx: watch::Sender<Arc<Settings>>,
    generation: AtomicU64,
    persistence: Option<Persistence>,
}

impl ConfigStore {
    pub fn open(
        settings: Settings,
        backend: Arc<dyn GpioBackend>,
        persistence: Option<Persistence>,
    ) -> Result<Self, ReloadError> {
        let bindings = bind(backend.as_ref(), &settings.pins)?;
        let settings = Arc::new(settings);
        let (settings_tx, _) = watch::channel(settings.clone());
        Ok(ConfigStore {
            backend,
            active: RwLock::new(Active {
                settings,
                generation: 0,
                bindings: Some(bindings),
            }),
            settings_tx,
            generation: AtomicU64::new(0),
            persistence,
        })
    }

    /// The latest published snapshot.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.settings_tx.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Active> {
        self.active.read().await
    }

    /// Validates `candidate`, rebinds the pins and publishes it as a new
    /// generation. On any error the previous configuration and bindings
    /// stay in effect.
    pub async fn reload(&self, candidate: &SettingsFile) -> Result<u64, ReloadError> {
        let settings = Settings::try_from(candidate)?;

        let mut active = self.active.write().await;
        let old = active.bindings.take().ok_or(ReloadError::ShutDown)?;
        let old_layout = active.settings.pins;
        let rebound = blocking(|| rebind(self.backend.as_ref(), &old_layout, old, &settings.pins));
        let bindings = match rebound {
            Ok(bindings) => bindings,
            Err((err, old)) => {
                active.bindings = Some(old);
                warn!("Reload failed, keeping generation {}: {}", active.generation, err);
                return Err(err);
            }
        };

        let settings = Arc::new(settings);
        active.bindings = Some(bindings);
        active.settings = settings.clone();
        active.generation += 1;
        let generation = active.generation;
        self.generation.store(generation, Ordering::Release);
        self.settings_tx.send_replace(settings.clone());
        drop(active);

        info!("Configuration generation {} is active", generation);
        blocking(|| self.persist(generation, &settings));
        Ok(generation)
    }

    fn persist(&self, generation: u64, settings: &Settings) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let mut written = persistence
            .written
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *written > generation {
            return;
        }
        *written = generation;
        let document = AppConfig {
            settings: SettingsFile::from(settings),
            ..persistence.document.clone()
        };
        if let Err(err) = document.save(&persistence.path) {
            error!("Failed to persist configuration: {:#}", err);
        }
    }

    /// Deactivates every output and releases all bindings. Waits for
    /// in-flight operations; later readers see [`Released`].
    pub async fn shutdown(&self) -> Result<(), GpioError> {
        let mut active = self.active.write().await;
        let Some(bindings) = active.bindings.take() else {
            return Ok(());
        };
        let Bindings {
            indicator,
            relay,
            buzzer,
            trigger,
        } = bindings;

        let mut result = Ok(());
        for (role, line) in [("relay", relay), ("buzzer", buzzer), ("indicator", indicator)] {
            let mut line = line.into_inner();
            if let Err(err) = line.set_low() {
                error!("Failed to deactivate {}: {}", role, err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        drop(trigger);
        info!("Pin bindings released");
        result
    }
}

fn bind(backend: &dyn GpioBackend, layout: &PinLayout) -> Result<Bindings, ReloadError> {
    let output = |role, spec| {
        backend
            .output(spec)
            .map(Mutex::new)
            .map_err(|source| ReloadError::Binding { role, source })
    };
    Ok(Bindings {
        indicator: output("indicator", layout.indicator)?,
        relay: output("relay", layout.relay)?,
        buzzer: output("buzzer", layout.buzzer)?,
        trigger: backend
            .input(layout.trigger)
            .map(Mutex::new)
            .map_err(|source| ReloadError::Binding {
                role: "trigger",
                source,
            })?,
    })
}

/// Runs pin and file I/O off the async workers where the runtime allows it.
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn output_mut(bindings: &mut Bindings, index: usize) -> &mut OutputLine {
    match index {
        0 => bindings.indicator.get_mut(),
        1 => bindings.relay.get_mut(),
        _ => bindings.buzzer.get_mut(),
    }
}

/// Builds the bindings for `next` out of `old`. A line whose pin and
/// polarity are unchanged is carried over (possibly into another output
/// role, in which case it is deactivated first); every other pin is
/// claimed while the old lines are still held, so a failed claim hands
/// `old` back untouched.
fn rebind(
    backend: &dyn GpioBackend,
    old_layout: &PinLayout,
    mut old: Bindings,
    next: &PinLayout,
) -> Result<Bindings, (ReloadError, Bindings)> {
    const ROLES: [&str; 3] = ["indicator", "relay", "buzzer"];

    let old_specs = [old_layout.indicator, old_layout.relay, old_layout.buzzer];
    let next_specs = [next.indicator, next.relay, next.buzzer];

    let mut slots: [Option<OutputLine>; 3] = [None, None, None];
    for ((role, spec), slot) in ROLES
        .into_iter()
        .zip(next_specs)
        .zip(slots.iter_mut())
    {
        if old_specs.contains(&spec) {
            continue;
        }
        match backend.output(spec) {
            Ok(line) => *slot = Some(line),
            Err(source) => return Err((ReloadError::Binding { role, source }, old)),
        }
    }
    let fresh_trigger = if old_layout.trigger == next.trigger {
        None
    } else {
        match backend.input(next.trigger) {
            Ok(line) => Some(line),
            Err(source) => {
                let err = ReloadError::Binding {
                    role: "trigger",
                    source,
                };
                return Err((err, old));
            }
        }
    };

    // A lit indicator handed to the relay must not energize it.
    for (index, spec) in old_specs.into_iter().enumerate() {
        let Some(target) = next_specs.iter().position(|next| *next == spec) else {
            continue;
        };
        if target == index {
            continue;
        }
        let deactivated = output_mut(&mut old, index).set_low();
        if let Err(source) = deactivated {
            let err = ReloadError::Binding {
                role: ROLES[target],
                source,
            };
            return Err((err, old));
        }
    }

    let Bindings {
        indicator,
        relay,
        buzzer,
        trigger,
    } = old;
    for (spec, line) in old_specs.into_iter().zip([indicator, relay, buzzer]) {
        match next_specs.iter().position(|next| *next == spec) {
            Some(index) => slots[index] = Some(line.into_inner()),
            // Dropping the line deactivates and releases it.
            None => drop(line),
        }
    }
    let trigger = match fresh_trigger {
        Some(line) => {
            drop(trigger);
            line
        }
        None => trigger.into_inner(),
    };

    let [Some(indicator), Some(relay), Some(buzzer)] = slots else {
        unreachable!("every output role is either carried over or freshly claimed");
    };
    Ok(Bindings {
        indicator: Mutex::new(indicator),
        relay: Mutex::new(relay),
        buzzer: Mutex::new(buzzer),
        trigger: Mutex::new(trigger),
    })
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::testing::*;
    use super::*;
    use crate::actuator::ActuatorController;
    use crate::blink::BlinkScheduler;
    use crate::gpio::{PinSpec, SimulatedGpio};
    use crate::messages::PresenceState;

    #[tokio::test]
    async fn test_open_binds_every_role() {
        let (store, gpio) = store();
        for pin in [INDICATOR, RELAY, BUZZER, TRIGGER] {
            assert!(gpio.is_claimed(pin));
        }
        assert_eq!(store.generation(), 0);
    }

    #[tokio::test]
    async fn test_reload_publishes_new_generation() {
        let (store, _gpio) = store();
        let settings_rx = store.subscribe();
        let mut file = settings_file();
        file.relay.pulse_seconds = 2.0;

        assert_eq!(store.reload(&file).await.unwrap(), 1);
        assert_eq!(store.generation(), 1);
        assert_eq!(store.settings().relay_pulse, Duration::from_secs(2));
        assert!(settings_rx.has_changed().unwrap());
        assert_eq!(store.read().await.generation, 1);
    }

    #[tokio::test]
    async fn test_rejected_reload_changes_nothing() {
        let (store, gpio) = store();
        let before = store.settings();
        let mut file = settings_file();
        file.presence.scan_interval_seconds = -1.0;
        file.pins.relay.pin = 6;

        let err = store.reload(&file).await.unwrap_err();
        assert!(matches!(err, ReloadError::Invalid(_)));
        assert_eq!(store.generation(), 0);
        assert_eq!(store.settings().scan_interval, before.scan_interval);
        assert!(gpio.is_claimed(RELAY));
        assert!(!gpio.is_claimed(6));
    }

    #[tokio::test]
    async fn test_reload_moves_pins() {
        let (store, gpio) = store();
        let mut file = settings_file();
        file.pins.relay.pin = 6;
        file.pins.trigger.pin = 13;
        store.reload(&file).await.unwrap();

        assert!(!gpio.is_claimed(RELAY));
        assert!(!gpio.is_claimed(TRIGGER));
        assert!(gpio.is_claimed(6));
        assert!(gpio.is_claimed(13));
        assert!(gpio.is_claimed(INDICATOR));

        ActuatorController::new(store.clone()).pulse_relay().await.unwrap();
        assert_eq!(gpio.history(6).len(), 2);
        assert!(gpio.history(RELAY).is_empty());
    }

    #[tokio::test]
    async fn test_reload_swaps_output_roles() {
        let (store, gpio) = store();
        let mut file = settings_file();
        file.pins.relay = file.pins.buzzer;
        file.pins.buzzer = settings_file().pins.relay;
        store.reload(&file).await.unwrap();

        ActuatorController::new(store.clone()).pulse_relay().await.unwrap();
        assert_eq!(gpio.history(BUZZER).len(), 2);
        assert!(gpio.history(RELAY).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lit_indicator_moved_to_relay_is_deactivated() {
        let (store, gpio) = store();
        let (_state_tx, state_rx) = tokio::sync::watch::channel(PresenceState::absent());
        let token = CancellationToken::new();
        let blinking = tokio::spawn(BlinkScheduler::new(store.clone(), state_rx).run(token.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(gpio.is_asserted(INDICATOR));

        let mut file = settings_file();
        file.pins.relay = PinSpec::new(INDICATOR, false);
        file.pins.indicator = PinSpec::new(6, false);
        store.reload(&file).await.unwrap();
        assert!(!gpio.is_asserted(INDICATOR));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!gpio.is_asserted(INDICATOR));
        assert!(!gpio.history(6).is_empty());

        ActuatorController::new(store.clone()).pulse_relay().await.unwrap();
        let levels: Vec<_> = gpio.history(INDICATOR).iter().map(|t| t.asserted).collect();
        assert_eq!(levels, vec![true, false, true, false]);

        token.cancel();
        blinking.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_deactivation_keeps_old_configuration() {
        let (store, gpio) = store();
        gpio.inject_fault(INDICATOR);
        let mut file = settings_file();
        file.pins.relay = PinSpec::new(INDICATOR, false);
        file.pins.indicator = PinSpec::new(6, false);

        let err = store.reload(&file).await.unwrap_err();
        assert!(matches!(err, ReloadError::Binding { role: "relay", .. }));
        assert_eq!(store.generation(), 0);
        assert!(!gpio.is_claimed(6));
        assert!(gpio.is_claimed(RELAY));
        assert!(gpio.is_claimed(INDICATOR));
    }

    #[tokio::test]
    async fn test_failed_binding_keeps_old_configuration() {
        let (store, gpio) = store();
        gpio.set_unavailable(12, true);
        let mut file = settings_file();
        file.pins.indicator.pin = 11;
        file.pins.buzzer.pin = 12;
        file.relay.pulse_seconds = 3.0;

        let err = store.reload(&file).await.unwrap_err();
        assert!(matches!(err, ReloadError::Binding { role: "buzzer", .. }));
        assert_eq!(store.generation(), 0);
        assert_eq!(store.settings().relay_pulse, Duration::from_millis(500));
        // The claim made for the indicator before the failure is given back.
        assert!(!gpio.is_claimed(11));
        assert!(gpio.is_claimed(INDICATOR));
        assert!(gpio.is_claimed(BUZZER));

        ActuatorController::new(store.clone()).pulse_relay().await.unwrap();
        assert_eq!(gpio.history(RELAY).len(), 2);
    }

    #[tokio::test]
    async fn test_reload_persists_document() {
        let path = std::env::temp_dir().join(format!("presence-relay-store-{}.toml", std::process::id()));
        let gpio = SimulatedGpio::new();
        let settings = Settings::try_from(&settings_file()).unwrap();
        let persistence = Persistence::new(path.clone(), AppConfig::default());
        let store = ConfigStore::open(settings, Arc::new(gpio), Some(persistence)).unwrap();

        let mut file = settings_file();
        file.beep.arrival.count = 5;
        store.reload(&file).await.unwrap();

        let written = AppConfig::load_or_create(&path).unwrap();
        assert_eq!(written.settings.beep.arrival.count, 5);
        assert_eq!(written.settings.presence.devices, vec!["AA:BB:CC:DD:EE:FF".to_string()]);

        // A write for an older generation that lost the race is skipped.
        let stale = Settings::try_from(&settings_file()).unwrap();
        store.persist(0, &stale);
        let written = AppConfig::load_or_create(&path).unwrap();
        assert_eq!(written.settings.beep.arrival.count, 5);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_shutdown_deactivates_and_releases() {
        let (store, gpio) = store();
        {
            let active = store.read().await;
            let bindings = active.bindings().unwrap();
            bindings.relay.lock().await.set_high().unwrap();
            bindings.indicator.lock().await.set_high().unwrap();
        }
        store.shutdown().await.unwrap();

        for pin in [INDICATOR, RELAY, BUZZER] {
            assert!(!gpio.is_asserted(pin));
        }
        for pin in [INDICATOR, RELAY, BUZZER, TRIGGER] {
            assert!(!gpio.is_claimed(pin));
        }
        assert!(store.read().await.bindings().is_err());
        assert!(matches!(store.reload(&settings_file()).await, Err(ReloadError::ShutDown)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reloads_and_pulses() {
        let mut file = settings_file();
        file.relay.pulse_seconds = 0.001;
        let (store, gpio) = store_with(&file);
        let actuators = ActuatorController::new(store.clone());

        let pulses = tokio::spawn({
            let actuators = actuators.clone();
            async move {
                for _ in 0..50 {
                    actuators.pulse_relay().await.unwrap();
                }
            }
        });
        let reloads = tokio::spawn({
            let store = store.clone();
            async move {
                for i in 0..50u8 {
                    let mut file = file.clone();
                    file.pins.relay.pin = if i % 2 == 0 { 6 } else { RELAY };
                    store.reload(&file).await.unwrap();
                }
            }
        });
        pulses.await.unwrap();
        reloads.await.unwrap();

        assert_eq!(store.generation(), 50);
        assert!(!gpio.is_asserted(RELAY));
        assert!(!gpio.is_asserted(6));
        let transitions = gpio.history(RELAY).len() + gpio.history(6).len();
        assert_eq!(transitions, 100);
    }
}
