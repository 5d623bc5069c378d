//! Physical pin bindings.
//!
//! Lines are handed out as `embedded-hal` digital pins where `high` always
//! means *asserted*: the backend applies the configured polarity, so the
//! rest of the program never reasons about active-low wiring. A
//! [`PinRegistry`] shared by every line of a backend refuses a second live
//! claim on the same pin.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use embedded_hal::digital::{ErrorKind, InputPin, OutputPin};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub mod simulated;
pub mod sysfs;

pub use simulated::SimulatedGpio;
pub use sysfs::SysfsGpio;

pub type OutputLine = Box<dyn OutputPin<Error = GpioError> + Send>;
pub type InputLine = Box<dyn InputPin<Error = GpioError> + Send>;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinSpec {
    pub pin: u8,
    #[serde(default)]
    pub active_low: bool,
}

impl PinSpec {
    pub const fn new(pin: u8, active_low: bool) -> Self {
        PinSpec { pin, active_low }
    }
}

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("pin {0} is already bound")]
    Busy(u8),
    #[error("pin {0} is not available")]
    Unavailable(u8),
    #[error("pin {pin}: {source}")]
    Io {
        pin: u8,
        #[source]
        source: std::io::Error,
    },
}

impl embedded_hal::digital::Error for GpioError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// Source of pin bindings. Outputs are returned deasserted.
pub trait GpioBackend: Send + Sync {
    fn output(&self, spec: PinSpec) -> Result<OutputLine, GpioError>;
    fn input(&self, spec: PinSpec) -> Result<InputLine, GpioError>;
}

#[derive(Clone, Default, Debug)]
pub struct PinRegistry {
    claimed: Arc<Mutex<HashSet<u8>>>,
}

impl PinRegistry {
    pub fn claim(&self, pin: u8) -> Result<PinClaim, GpioError> {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(pin) {
            return Err(GpioError::Busy(pin));
        }
        Ok(PinClaim {
            pin,
            registry: self.clone(),
        })
    }

    pub fn is_claimed(&self, pin: u8) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&pin)
    }
}

/// Held by a live line; dropping it frees the pin for the next claim.
#[derive(Debug)]
pub struct PinClaim {
    pin: u8,
    registry: PinRegistry,
}

impl PinClaim {
    pub fn pin(&self) -> u8 {
        self.pin
    }
}

impl Drop for PinClaim {
    fn drop(&mut self) {
        self.registry
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.pin);
    }
}
