//! In-memory pins. Used by `--simulate` and by the tests, which inspect the
//! recorded transitions to check pulse and beep timing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use log::debug;
use tokio::time::Instant;

use super::{GpioBackend, GpioError, InputLine, OutputLine, PinClaim, PinRegistry, PinSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub pin: u8,
    pub asserted: bool,
    pub at: Instant,
}

#[derive(Default, Debug)]
struct Bench {
    outputs: HashMap<u8, bool>,
    inputs: HashMap<u8, bool>,
    history: Vec<Transition>,
    faulty: HashSet<u8>,
    unavailable: HashSet<u8>,
}

#[derive(Clone, Default, Debug)]
pub struct SimulatedGpio {
    registry: PinRegistry,
    bench: Arc<Mutex<Bench>>,
}

impl SimulatedGpio {
    pub fn new() -> Self {
        SimulatedGpio::default()
    }

    fn bench(&self) -> MutexGuard<'_, Bench> {
        self.bench.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drives a simulated input, e.g. a button press.
    pub fn set_input(&self, pin: u8, asserted: bool) {
        self.bench().inputs.insert(pin, asserted);
    }

    pub fn is_asserted(&self, pin: u8) -> bool {
        self.bench().outputs.get(&pin).copied().unwrap_or(false)
    }

    pub fn is_claimed(&self, pin: u8) -> bool {
        self.registry.is_claimed(pin)
    }

    /// Output transitions recorded for `pin`, oldest first.
    pub fn history(&self, pin: u8) -> Vec<Transition> {
        self.bench()
            .history
            .iter()
            .filter(|t| t.pin == pin)
            .copied()
            .collect()
    }

    /// Every later write to `pin` fails, as disconnected hardware would.
    pub fn inject_fault(&self, pin: u8) {
        self.bench().faulty.insert(pin);
    }

    /// New bindings on `pin` fail.
    pub fn set_unavailable(&self, pin: u8, unavailable: bool) {
        let mut bench = self.bench();
        if unavailable {
            bench.unavailable.insert(pin);
        } else {
            bench.unavailable.remove(&pin);
        }
    }

    fn claim(&self, pin: u8) -> Result<PinClaim, GpioError> {
        if self.bench().unavailable.contains(&pin) {
            return Err(GpioError::Unavailable(pin));
        }
        self.registry.claim(pin)
    }
}

impl GpioBackend for SimulatedGpio {
    fn output(&self, spec: PinSpec) -> Result<OutputLine, GpioError> {
        let claim = self.claim(spec.pin)?;
        self.bench().outputs.insert(spec.pin, false);
        Ok(Box::new(SimulatedOutput {
            bench: self.bench.clone(),
            claim,
        }))
    }

    fn input(&self, spec: PinSpec) -> Result<InputLine, GpioError> {
        let claim = self.claim(spec.pin)?;
        Ok(Box::new(SimulatedInput {
            bench: self.bench.clone(),
            claim,
        }))
    }
}

struct SimulatedOutput {
    bench: Arc<Mutex<Bench>>,
    claim: PinClaim,
}

impl SimulatedOutput {
    fn write(&mut self, asserted: bool) -> Result<(), GpioError> {
        let pin = self.claim.pin();
        let mut bench = self.bench.lock().unwrap_or_else(PoisonError::into_inner);
        if bench.faulty.contains(&pin) {
            return Err(GpioError::Io {
                pin,
                source: std::io::Error::other("simulated hardware fault"),
            });
        }
        let previous = bench.outputs.insert(pin, asserted);
        if previous != Some(asserted) {
            debug!("Simulated pin {} -> {}", pin, if asserted { "on" } else { "off" });
            bench.history.push(Transition {
                pin,
                asserted,
                at: Instant::now(),
            });
        }
        Ok(())
    }
}

impl ErrorType for SimulatedOutput {
    type Error = GpioError;
}

impl OutputPin for SimulatedOutput {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write(true)
    }
}

impl Drop for SimulatedOutput {
    fn drop(&mut self) {
        let _ = self.write(false);
    }
}

struct SimulatedInput {
    bench: Arc<Mutex<Bench>>,
    claim: PinClaim,
}

impl ErrorType for SimulatedInput {
    type Error = GpioError;
}

impl InputPin for SimulatedInput {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        let bench = self.bench.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(bench.inputs.get(&self.claim.pin()).copied().unwrap_or(false))
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.is_high().map(|high| !high)
    }
}
