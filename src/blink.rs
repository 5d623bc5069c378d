use std::sync::Arc;

use log::debug;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::actuator::ActuatorError;
use crate::messages::PresenceState;
use crate::store::ConfigStore;

/// Blinks the indicator with the cadence of the current presence state.
/// A presence or configuration change restarts the cadence right away,
/// beginning with the light on.
pub struct BlinkScheduler {
    store: Arc<ConfigStore>,
    presence: watch::Receiver<PresenceState>,
}

impl BlinkScheduler {
    pub fn new(store: Arc<ConfigStore>, presence: watch::Receiver<PresenceState>) -> Self {
        BlinkScheduler { store, presence }
    }

    async fn set_indicator(&self, lit: bool) -> Result<(), ActuatorError> {
        let active = self.store.read().await;
        let mut indicator = active.bindings()?.indicator.lock().await;
        if lit {
            indicator.set_high()?;
        } else {
            indicator.set_low()?;
        }
        Ok(())
    }

    pub async fn run(mut self, token: CancellationToken) -> anyhow::Result<()> {
        let mut settings = self.store.subscribe();
        let mut lit = false;
        loop {
            let present = self.presence.borrow_and_update().presence.is_present();
            let interval = settings.borrow_and_update().blink_interval(present);

            lit = !lit;
            match self.set_indicator(lit).await {
                Ok(()) => {}
                Err(ActuatorError::Released(_)) => break,
                Err(err) => return Err(err.into()),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                changed = self.presence.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!("Presence changed, restarting blink cadence");
                    lit = false;
                }
                changed = settings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    lit = false;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Blink scheduler stopped");
        Ok(())
    }
}
