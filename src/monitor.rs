use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use mac_address::MacAddress;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::messages::{Presence, PresenceEvent, PresenceState};
use crate::scanner::PresenceProbe;
use crate::store::ConfigStore;

const EVENT_CAPACITY: usize = 16;

/// Polls the probe for every configured device and owns the presence model:
/// it is the only writer of [`PresenceState`] and the only source of
/// [`PresenceEvent`]s.
pub struct PresenceMonitor {
    probe: Arc<dyn PresenceProbe>,
    store: Arc<ConfigStore>,
    state: watch::Sender<PresenceState>,
    events: broadcast::Sender<PresenceEvent>,
    last_seen: HashMap<MacAddress, Instant>,
    timed_out: Vec<MacAddress>,
}

impl PresenceMonitor {
    pub fn new(probe: Arc<dyn PresenceProbe>, store: Arc<ConfigStore>) -> Self {
        let (state, _) = watch::channel(PresenceState::absent());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        PresenceMonitor {
            probe,
            store,
            state,
            events,
            last_seen: HashMap::new(),
            timed_out: Vec::new(),
        }
    }

    pub fn state(&self) -> watch::Receiver<PresenceState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Probes every device once, in order, and publishes a transition if
    /// the aggregate differs from the current state.
    pub async fn tick(&mut self) -> Option<PresenceEvent> {
        let settings = self.store.settings();
        // Bookkeeping only spans the devices configured right now.
        self.last_seen.retain(|address, _| settings.devices.contains(address));
        self.timed_out.retain(|address| settings.devices.contains(address));

        let mut responding = false;
        for address in &settings.devices {
            match self.probe.query(address, settings.probe_timeout).await {
                Ok(true) => {
                    responding = true;
                    self.last_seen.insert(*address, Instant::now());
                    self.timed_out.retain(|timed_out| timed_out != address);
                }
                Ok(false) => debug!("{} is not responding", address),
                Err(err) => warn!("Probe for {} failed: {}", address, err),
            }
        }

        for address in &settings.devices {
            let expired = self
                .last_seen
                .get(address)
                .is_some_and(|seen| seen.elapsed() > settings.absence_timeout);
            if expired && !self.timed_out.contains(address) {
                info!(
                    "{} has not been seen for more than {:?}",
                    address, settings.absence_timeout
                );
                self.timed_out.push(*address);
            }
        }

        let presence = Presence::from_responding(responding);
        if self.state.borrow().presence == presence {
            return None;
        }

        let at = Instant::now();
        self.state.send_replace(PresenceState { presence, since: at });
        let event = PresenceEvent {
            presence,
            at,
            generation: self.store.generation(),
        };
        info!("State changed to {:?}", presence);
        // Nobody listening is fine.
        let _ = self.events.send(event);
        Some(event)
    }

    /// Ticks until cancelled. Probe latency adds to the scan interval.
    pub async fn run(mut self, token: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.tick() => {}
            }
            let interval = self.store.settings().scan_interval;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Presence monitor stopped");
        Ok(())
    }
}
