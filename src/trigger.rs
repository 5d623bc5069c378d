//! The manual trigger: a polled, debounced button that pulses the relay
//! while a device is present.
//!
//! [`EdgeDetector`] samples the input and sends one [`TriggerPress`] per
//! debounced press over a channel; [`ManualTrigger`] consumes them. A press
//! carries the configuration generation it was seen under and is discarded
//! if a reload happened in between. Presses that arrive while the relay is
//! being pulsed are dropped, not queued.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::actuator::{self, ActuatorError};
use crate::messages::{PresenceState, TriggerPress};
use crate::store::ConfigStore;

/// Accepts a level change only after it has held for the debounce window.
#[derive(Debug, Clone, Copy)]
pub struct Debouncer {
    stable: bool,
    pending: Option<(bool, Instant)>,
}

impl Debouncer {
    pub fn new(level: bool) -> Self {
        Debouncer {
            stable: level,
            pending: None,
        }
    }

    /// Feeds one sample; returns the new stable level when it changes.
    pub fn sample(&mut self, level: bool, now: Instant, window: Duration) -> Option<bool> {
        if level == self.stable {
            self.pending = None;
            return None;
        }
        match self.pending {
            Some((pending, since)) if pending == level => {
                if now.duration_since(since) >= window {
                    self.stable = level;
                    self.pending = None;
                    return Some(level);
                }
            }
            _ => self.pending = Some((level, now)),
        }
        None
    }
}

pub fn press_channel() -> (mpsc::Sender<TriggerPress>, mpsc::Receiver<TriggerPress>) {
    mpsc::channel(1)
}

pub struct EdgeDetector {
    store: Arc<ConfigStore>,
    presses: mpsc::Sender<TriggerPress>,
}

impl EdgeDetector {
    pub fn new(store: Arc<ConfigStore>, presses: mpsc::Sender<TriggerPress>) -> Self {
        EdgeDetector { store, presses }
    }

    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        let mut debouncer = Debouncer::new(false);
        let mut seeded: Option<u64> = None;

        loop {
            let poll = {
                let active = self.store.read().await;
                let Ok(bindings) = active.bindings() else {
                    break;
                };
                let level = bindings.trigger.lock().await.is_high()?;

                if seeded != Some(active.generation) {
                    // A freshly bound input starts from its current level;
                    // a button held across a reload is not a press.
                    debouncer = Debouncer::new(level);
                    seeded = Some(active.generation);
                } else if debouncer.sample(level, Instant::now(), active.settings.trigger_debounce)
                    == Some(true)
                {
                    let press = TriggerPress {
                        generation: active.generation,
                    };
                    match self.presses.try_send(press) {
                        Ok(()) => debug!("Trigger pressed"),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("Trigger pressed while busy, dropping press")
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                active.settings.trigger_poll_interval
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }
        debug!("Edge detector stopped");
        Ok(())
    }
}

pub struct ManualTrigger {
    store: Arc<ConfigStore>,
    presence: watch::Receiver<PresenceState>,
    presses: mpsc::Receiver<TriggerPress>,
}

impl ManualTrigger {
    pub fn new(
        store: Arc<ConfigStore>,
        presence: watch::Receiver<PresenceState>,
        presses: mpsc::Receiver<TriggerPress>,
    ) -> Self {
        ManualTrigger {
            store,
            presence,
            presses,
        }
    }

    /// Pulses the relay for `press` if it is current and a device is
    /// present. Returns whether the relay fired.
    pub async fn handle(&self, press: TriggerPress) -> Result<bool, ActuatorError> {
        let active = self.store.read().await;
        if press.generation != active.generation {
            info!(
                "Ignoring press from superseded configuration generation {}",
                press.generation
            );
            return Ok(false);
        }
        if !self.presence.borrow().presence.is_present() {
            info!("Button pressed but no device present, relay stays off");
            return Ok(false);
        }

        info!("Button pressed, activating relay");
        actuator::pulse(&active.bindings()?.relay, active.settings.relay_pulse).await?;
        Ok(true)
    }

    pub async fn run(mut self, token: CancellationToken) -> anyhow::Result<()> {
        loop {
            let press = tokio::select! {
                _ = token.cancelled() => break,
                press = self.presses.recv() => match press {
                    Some(press) => press,
                    None => break,
                },
            };
            tokio::select! {
                _ = token.cancelled() => break,
                handled = self.handle(press) => { handled?; }
            }
            while let Ok(dropped) = self.presses.try_recv() {
                debug!("Dropping {:?} received during a pulse", dropped);
            }
        }
        debug!("Manual trigger stopped");
        Ok(())
    }
}
