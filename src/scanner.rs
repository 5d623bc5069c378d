//! Presence probes: "does this address answer right now?"

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use btleplug::api::{BDAddr, Central as _, CentralEvent, Peripheral as _, ScanFilter};
use futures::StreamExt as _;
use futures::future::BoxFuture;
use log::{debug, error, info};
use mac_address::MacAddress;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to run probe: {0}")]
    Io(#[from] std::io::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

pub trait PresenceProbe: Send + Sync {
    /// Resolves to whether `address` responded within `timeout`.
    fn query<'a>(
        &'a self,
        address: &'a MacAddress,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<bool, ProbeError>>;
}

/// Classic Bluetooth name request through BlueZ's `hcitool name`. A device
/// that is in range answers with its name; otherwise the output is empty.
#[derive(Debug, Default)]
pub struct HcitoolProbe;

impl PresenceProbe for HcitoolProbe {
    fn query<'a>(
        &'a self,
        address: &'a MacAddress,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<bool, ProbeError>> {
        Box::pin(async move {
            let output = Command::new("hcitool")
                .arg("name")
                .arg(address.to_string())
                .kill_on_drop(true)
                .output();
            let output = tokio::time::timeout(timeout, output)
                .await
                .map_err(|_| ProbeError::Timeout(timeout))??;
            let name = String::from_utf8_lossy(&output.stdout);
            let name = name.trim();
            if name.is_empty() {
                debug!("{} did not answer", address);
                Ok(false)
            } else {
                debug!("{} answered as {:?}", address, name);
                Ok(true)
            }
        })
    }
}

/// Passive BLE scanning: a background task records the last advertisement
/// heard from every address, and a query succeeds when the address has
/// advertised within the timeout window.
pub struct BleAdvertisementProbe {
    last_seen: Arc<Mutex<HashMap<[u8; 6], Instant>>>,
    advertised: Arc<Notify>,
}

impl BleAdvertisementProbe {
    pub async fn start(
        adapter: btleplug::platform::Adapter,
        token: CancellationToken,
    ) -> Result<Self, ProbeError> {
        let mut events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        info!("BLE scan started");

        let last_seen = Arc::new(Mutex::new(HashMap::new()));
        let advertised = Arc::new(Notify::new());
        let probe = BleAdvertisementProbe {
            last_seen: last_seen.clone(),
            advertised: advertised.clone(),
        };

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.next() => event,
                };
                let id = match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id))
                    | Some(CentralEvent::ManufacturerDataAdvertisement { id, .. })
                    | Some(CentralEvent::ServiceDataAdvertisement { id, .. })
                    | Some(CentralEvent::ServicesAdvertisement { id, .. }) => id,
                    Some(_) => continue,
                    None => {
                        error!("BLE event stream closed");
                        break;
                    }
                };
                let address = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral.address(),
                    Err(err) => {
                        debug!("Advertisement from unknown peripheral {:?}: {}", id, err);
                        continue;
                    }
                };
                record(&last_seen, address);
                advertised.notify_waiters();
            }
            if let Err(err) = adapter.stop_scan().await {
                debug!("Failed to stop BLE scan: {}", err);
            }
        });

        Ok(probe)
    }

    fn seen_since(&self, address: &MacAddress, cutoff: Instant) -> bool {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address.bytes())
            .is_some_and(|seen| *seen >= cutoff)
    }
}

fn record(last_seen: &Mutex<HashMap<[u8; 6], Instant>>, address: BDAddr) {
    last_seen
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(address.into_inner(), Instant::now());
}

impl PresenceProbe for BleAdvertisementProbe {
    fn query<'a>(
        &'a self,
        address: &'a MacAddress,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<bool, ProbeError>> {
        Box::pin(async move {
            let now = Instant::now();
            let cutoff = now.checked_sub(timeout).unwrap_or(now);
            let deadline = now + timeout;
            loop {
                let advertised = self.advertised.notified();
                if self.seen_since(address, cutoff) {
                    return Ok(true);
                }
                tokio::select! {
                    _ = advertised => {}
                    _ = tokio::time::sleep_until(deadline) => return Ok(false),
                }
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ble_probe_uses_recent_advertisements() {
        let probe = BleAdvertisementProbe {
            last_seen: Arc::new(Mutex::new(HashMap::new())),
            advertised: Arc::new(Notify::new()),
        };
        let address: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let bdaddr = BDAddr::from(address.bytes());

        assert!(!probe.query(&address, Duration::from_secs(2)).await.unwrap());

        record(&probe.last_seen, bdaddr);
        assert!(probe.query(&address, Duration::from_secs(2)).await.unwrap());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!probe.query(&address, Duration::from_secs(2)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ble_probe_waits_for_fresh_advertisement() {
        let last_seen = Arc::new(Mutex::new(HashMap::new()));
        let advertised = Arc::new(Notify::new());
        let probe = BleAdvertisementProbe {
            last_seen: last_seen.clone(),
            advertised: advertised.clone(),
        };
        let address: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            record(&last_seen, BDAddr::from(address.bytes()));
            advertised.notify_waiters();
        });

        let started = Instant::now();
        assert!(probe.query(&address, Duration::from_secs(2)).await.unwrap());
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }
}
