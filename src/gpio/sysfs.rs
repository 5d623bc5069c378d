//! Linux `/sys/class/gpio` lines.
//!
//! Polarity is delegated to the kernel through the `active_low` attribute,
//! so `value` reads and writes are already logical. Outputs are switched to
//! output mode with their *inactive* physical level to avoid a glitch on
//! active-low relays.

use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use log::{debug, warn};

use super::{GpioBackend, GpioError, InputLine, OutputLine, PinClaim, PinRegistry, PinSpec};

pub const DEFAULT_ROOT: &str = "/sys/class/gpio";

// udev needs a moment to fix permissions on a freshly exported line.
const EXPORT_RETRIES: u32 = 10;
const EXPORT_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
    registry: PinRegistry,
}

impl SysfsGpio {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SysfsGpio {
            root: root.into(),
            registry: PinRegistry::default(),
        }
    }

    fn line_dir(&self, pin: u8) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    fn open(&self, spec: PinSpec, direction: &str) -> Result<SysfsLine, GpioError> {
        let claim = self.registry.claim(spec.pin)?;
        let pin = spec.pin;
        let io = move |source: std::io::Error| GpioError::Io { pin, source };

        let dir = self.line_dir(pin);
        if !dir.exists() {
            fs::write(self.root.join("export"), pin.to_string()).map_err(io)?;
        }

        let mut attempt = 0;
        loop {
            match configure(&dir, spec, direction) {
                Ok(()) => break,
                Err(err) if attempt < EXPORT_RETRIES => {
                    debug!("gpio{pin} not ready yet: {err}");
                    attempt += 1;
                    thread::sleep(EXPORT_RETRY_DELAY);
                }
                Err(err) => {
                    unexport(&self.root, pin);
                    return Err(io(err));
                }
            }
        }

        let value = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join("value"))
            .map_err(io)?;

        Ok(SysfsLine {
            root: self.root.clone(),
            value,
            output: direction != "in",
            claim,
        })
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        SysfsGpio::new(DEFAULT_ROOT)
    }
}

fn configure(dir: &Path, spec: PinSpec, direction: &str) -> std::io::Result<()> {
    fs::write(dir.join("direction"), direction)?;
    fs::write(dir.join("active_low"), if spec.active_low { "1" } else { "0" })
}

fn unexport(root: &Path, pin: u8) {
    if let Err(err) = fs::write(root.join("unexport"), pin.to_string()) {
        warn!("Failed to unexport gpio{pin}: {err}");
    }
}

impl GpioBackend for SysfsGpio {
    fn output(&self, spec: PinSpec) -> Result<OutputLine, GpioError> {
        // "high"/"low" set the raw level, before active_low applies.
        let inactive = if spec.active_low { "high" } else { "low" };
        Ok(Box::new(self.open(spec, inactive)?))
    }

    fn input(&self, spec: PinSpec) -> Result<InputLine, GpioError> {
        Ok(Box::new(self.open(spec, "in")?))
    }
}

struct SysfsLine {
    root: PathBuf,
    value: File,
    output: bool,
    claim: PinClaim,
}

impl SysfsLine {
    fn write(&mut self, asserted: bool) -> Result<(), GpioError> {
        let pin = self.claim.pin();
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.write_all(if asserted { b"1" } else { b"0" }))
            .map_err(|source| GpioError::Io { pin, source })
    }

    fn read(&mut self) -> Result<bool, GpioError> {
        let pin = self.claim.pin();
        let mut buf = [0u8; 2];
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.read(&mut buf))
            .map_err(|source| GpioError::Io { pin, source })?;
        Ok(buf[0] == b'1')
    }
}

impl ErrorType for SysfsLine {
    type Error = GpioError;
}

impl OutputPin for SysfsLine {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write(true)
    }
}

impl InputPin for SysfsLine {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.read()
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.read().map(|high| !high)
    }
}

impl Drop for SysfsLine {
    fn drop(&mut self) {
        let pin = self.claim.pin();
        if self.output {
            if let Err(err) = self.write(false) {
                warn!("Failed to deactivate gpio{pin} on release: {err}");
            }
        }
        unexport(&self.root, pin);
    }
}
