//! Relay pulses and buzzer beeps.
//!
//! Every activation goes through [`Energized`], which deactivates the line
//! when dropped. A pulse or beep future that is cancelled mid-way therefore
//! still leaves its output off.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

use crate::gpio::{GpioError, OutputLine};
use crate::messages::PresenceEvent;
use crate::store::{ConfigStore, Released};

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error(transparent)]
    Gpio(#[from] GpioError),
    #[error(transparent)]
    Released(#[from] Released),
}

struct Energized<'a> {
    line: &'a mut OutputLine,
    armed: bool,
}

impl<'a> Energized<'a> {
    fn engage(line: &'a mut OutputLine) -> Result<Self, GpioError> {
        let energized = Energized { line, armed: true };
        energized.line.set_high()?;
        Ok(energized)
    }

    fn release(mut self) -> Result<(), GpioError> {
        let result = self.line.set_low();
        if result.is_ok() {
            self.armed = false;
        }
        result
    }
}

impl Drop for Energized<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.line.set_low() {
                error!("Failed to deactivate output: {}", err);
            }
        }
    }
}

/// Holds `line` active for `hold`. Concurrent pulses on the same line queue
/// on its mutex.
pub async fn pulse(line: &Mutex<OutputLine>, hold: Duration) -> Result<(), GpioError> {
    let mut line = line.lock().await;
    let on = Energized::engage(&mut line)?;
    tokio::time::sleep(hold).await;
    on.release()
}

/// `count` cycles of `interval` on, `interval` off.
pub async fn beep(line: &Mutex<OutputLine>, count: u32, interval: Duration) -> Result<(), GpioError> {
    let mut line = line.lock().await;
    for _ in 0..count {
        let on = Energized::engage(&mut line)?;
        tokio::time::sleep(interval).await;
        on.release()?;
        tokio::time::sleep(interval).await;
    }
    Ok(())
}

#[derive(Clone)]
pub struct ActuatorController {
    store: Arc<ConfigStore>,
}

impl ActuatorController {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        ActuatorController { store }
    }

    /// Pulses the relay for the configured duration.
    pub async fn pulse_relay(&self) -> Result<(), ActuatorError> {
        let active = self.store.read().await;
        let hold = active.settings.relay_pulse;
        pulse(&active.bindings()?.relay, hold).await?;
        Ok(())
    }

    pub async fn beep(&self, count: u32, interval: Duration) -> Result<(), ActuatorError> {
        let active = self.store.read().await;
        beep(&active.bindings()?.buzzer, count, interval).await?;
        Ok(())
    }

    /// Beeps the arrival or departure pattern for every presence change.
    /// A failing buzzer ends the loop with an error.
    pub async fn run_feedback(
        self,
        mut events: broadcast::Receiver<PresenceEvent>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => {
                    let pattern = self.store.settings().beep_pattern(event.presence.is_present());
                    info!(
                        "Beeping {} x {:?} for {:?}",
                        pattern.count, pattern.duration, event.presence
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        result = self.beep(pattern.count, pattern.duration) => result?,
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Feedback fell behind, skipped {} presence events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Presence;
    use crate::store::testing::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_pulse_holds_for_configured_duration() {
        let (store, gpio) = store();
        let started = Instant::now();
        ActuatorController::new(store).pulse_relay().await.unwrap();

        let history = gpio.history(RELAY);
        assert_eq!(history.len(), 2);
        assert!(history[0].asserted);
        assert!(!history[1].asserted);
        assert_eq!(history[0].at, started);
        assert_eq!(history[1].at - history[0].at, Duration::from_millis(500));
        assert!(!gpio.is_asserted(RELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_pulse_deactivates_relay() {
        let (store, gpio) = store();
        let actuators = ActuatorController::new(store);
        let interrupted =
            tokio::time::timeout(Duration::from_millis(200), actuators.pulse_relay()).await;
        assert!(interrupted.is_err());

        let history = gpio.history(RELAY);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].at - history[0].at, Duration::from_millis(200));
        assert!(!gpio.is_asserted(RELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_beep_cycles() {
        let (store, gpio) = store();
        let started = Instant::now();
        ActuatorController::new(store)
            .beep(3, Duration::from_millis(100))
            .await
            .unwrap();

        let history = gpio.history(BUZZER);
        assert_eq!(history.len(), 6);
        for (i, transition) in history.iter().enumerate() {
            assert_eq!(transition.asserted, i % 2 == 0);
            assert_eq!(transition.at - started, Duration::from_millis(100) * i as u32);
        }
        assert_eq!(started.elapsed(), Duration::from_millis(600));
        assert!(!gpio.is_asserted(BUZZER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_toggle_is_reported() {
        let (store, gpio) = store();
        gpio.inject_fault(BUZZER);
        let result = ActuatorController::new(store)
            .beep(1, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(ActuatorError::Gpio(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_pulses_do_not_overlap() {
        let (store, gpio) = store();
        let actuators = ActuatorController::new(store);
        let (a, b) = tokio::join!(actuators.pulse_relay(), actuators.pulse_relay());
        a.unwrap();
        b.unwrap();

        let levels: Vec<_> = gpio.history(RELAY).iter().map(|t| t.asserted).collect();
        assert_eq!(levels, vec![true, false, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feedback_beeps_per_event() {
        let mut file = settings_file();
        file.beep.arrival.count = 2;
        file.beep.departure.count = 3;
        let (store, gpio) = store_with(&file);
        let (tx, rx) = broadcast::channel(4);
        let token = CancellationToken::new();
        let feedback =
            tokio::spawn(ActuatorController::new(store).run_feedback(rx, token.clone()));

        for presence in [Presence::Present, Presence::Absent] {
            tx.send(PresenceEvent {
                presence,
                at: Instant::now(),
                generation: 0,
            })
            .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
        feedback.await.unwrap().unwrap();

        assert_eq!(gpio.history(BUZZER).len(), 2 * (2 + 3));
    }
}
