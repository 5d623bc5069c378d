use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use mac_address::MacAddress;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::gpio::PinSpec;

/// Everything read from the configuration file. Only the flattened
/// [`SettingsFile`] part can be replaced at runtime; the probe, GPIO and
/// MQTT sections are fixed for the lifetime of the process.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct AppConfig {
    #[serde(flatten)]
    pub settings: SettingsFile,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeBackend {
    /// `hcitool name <addr>`, a classic Bluetooth name request.
    #[default]
    Hcitool,
    /// Passive BLE advertisement scanning.
    Ble,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ProbeConfig {
    #[serde(default)]
    pub backend: ProbeBackend,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GpioBackendKind {
    #[default]
    Sysfs,
    Simulated,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct GpioConfig {
    #[serde(default)]
    pub backend: GpioBackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sysfs_root: Option<PathBuf>,
}

/// The hot-reloadable part of the configuration, as written on disk.
/// Values are kept loosely typed here so that validation can report every
/// offending field instead of failing on the first one.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct SettingsFile {
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub beep: BeepConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub indicator: IndicatorConfig,
    #[serde(default)]
    pub pins: PinConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PresenceConfig {
    pub devices: Vec<String>,
    pub scan_interval_seconds: f64,
    pub absence_timeout_seconds: f64,
    pub probe_timeout_seconds: f64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        PresenceConfig {
            devices: vec!["0C:15:63:DF:61:2F".to_string()],
            scan_interval_seconds: 7.0,
            absence_timeout_seconds: 15.0,
            probe_timeout_seconds: 5.0,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub pulse_seconds: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig { pulse_seconds: 0.5 }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BeepPatternConfig {
    pub duration_seconds: f64,
    pub count: i64,
}

impl Default for BeepPatternConfig {
    fn default() -> Self {
        BeepPatternConfig {
            duration_seconds: 0.1,
            count: 2,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct BeepConfig {
    #[serde(default)]
    pub arrival: BeepPatternConfig,
    #[serde(default)]
    pub departure: BeepPatternConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TriggerConfig {
    pub debounce_seconds: f64,
    pub poll_interval_seconds: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig {
            debounce_seconds: 0.2,
            poll_interval_seconds: 0.01,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct IndicatorConfig {
    pub present_blink_seconds: f64,
    pub absent_blink_seconds: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        IndicatorConfig {
            present_blink_seconds: 0.7,
            absent_blink_seconds: 1.2,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PinConfig {
    pub indicator: PinSpec,
    pub relay: PinSpec,
    pub buzzer: PinSpec,
    pub trigger: PinSpec,
}

impl Default for PinConfig {
    fn default() -> Self {
        PinConfig {
            indicator: PinSpec::new(23, false),
            relay: PinSpec::new(26, true),
            buzzer: PinSpec::new(19, true),
            // Button to ground with the pull-up enabled, so pressed reads low.
            trigger: PinSpec::new(5, true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeepPattern {
    pub count: u32,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinLayout {
    pub indicator: PinSpec,
    pub relay: PinSpec,
    pub buzzer: PinSpec,
    pub trigger: PinSpec,
}

/// A validated, immutable configuration snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub devices: Vec<MacAddress>,
    pub scan_interval: Duration,
    pub absence_timeout: Duration,
    pub probe_timeout: Duration,
    pub relay_pulse: Duration,
    pub arrival_beep: BeepPattern,
    pub departure_beep: BeepPattern,
    pub trigger_debounce: Duration,
    pub trigger_poll_interval: Duration,
    pub present_blink: Duration,
    pub absent_blink: Duration,
    pub pins: PinLayout,
}

impl Settings {
    pub fn blink_interval(&self, present: bool) -> Duration {
        if present {
            self.present_blink
        } else {
            self.absent_blink
        }
    }

    pub fn beep_pattern(&self, present: bool) -> BeepPattern {
        if present {
            self.arrival_beep
        } else {
            self.departure_beep
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        FieldError {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|e| e.field.as_str())
    }
}

fn positive_duration(field: &str, seconds: f64, errors: &mut Vec<FieldError>) -> Duration {
    if !(seconds > 0.0) {
        errors.push(FieldError::new(field, format!("must be positive, got {seconds}")));
        return Duration::ZERO;
    }
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) => duration,
        Err(err) => {
            errors.push(FieldError::new(field, err.to_string()));
            Duration::ZERO
        }
    }
}

fn positive_count(field: &str, count: i64, errors: &mut Vec<FieldError>) -> u32 {
    match u32::try_from(count) {
        Ok(count) if count > 0 => count,
        _ => {
            errors.push(FieldError::new(field, format!("must be a positive count, got {count}")));
            0
        }
    }
}

impl TryFrom<&SettingsFile> for Settings {
    type Error = ValidationErrors;

    fn try_from(file: &SettingsFile) -> Result<Self, Self::Error> {
        let mut errors = Vec::new();

        let mut devices = Vec::new();
        for raw in &file.presence.devices {
            match raw.trim().parse::<MacAddress>() {
                Ok(address) if !devices.contains(&address) => devices.push(address),
                Ok(_) => {}
                Err(_) => errors.push(FieldError::new(
                    "presence.devices",
                    format!("`{raw}` is not a MAC address"),
                )),
            }
        }
        if file.presence.devices.is_empty() {
            errors.push(FieldError::new("presence.devices", "at least one device is required"));
        }

        let p = &file.presence;
        let scan_interval =
            positive_duration("presence.scan_interval_seconds", p.scan_interval_seconds, &mut errors);
        let absence_timeout = positive_duration(
            "presence.absence_timeout_seconds",
            p.absence_timeout_seconds,
            &mut errors,
        );
        if !scan_interval.is_zero() && !absence_timeout.is_zero() && absence_timeout < scan_interval {
            errors.push(FieldError::new(
                "presence.absence_timeout_seconds",
                "must not be shorter than the scan interval",
            ));
        }
        let probe_timeout =
            positive_duration("presence.probe_timeout_seconds", p.probe_timeout_seconds, &mut errors);

        let relay_pulse = positive_duration("relay.pulse_seconds", file.relay.pulse_seconds, &mut errors);

        let arrival_beep = BeepPattern {
            count: positive_count("beep.arrival.count", file.beep.arrival.count, &mut errors),
            duration: positive_duration(
                "beep.arrival.duration_seconds",
                file.beep.arrival.duration_seconds,
                &mut errors,
            ),
        };
        let departure_beep = BeepPattern {
            count: positive_count("beep.departure.count", file.beep.departure.count, &mut errors),
            duration: positive_duration(
                "beep.departure.duration_seconds",
                file.beep.departure.duration_seconds,
                &mut errors,
            ),
        };

        let trigger_debounce =
            positive_duration("trigger.debounce_seconds", file.trigger.debounce_seconds, &mut errors);
        let trigger_poll_interval = positive_duration(
            "trigger.poll_interval_seconds",
            file.trigger.poll_interval_seconds,
            &mut errors,
        );

        let present_blink = positive_duration(
            "indicator.present_blink_seconds",
            file.indicator.present_blink_seconds,
            &mut errors,
        );
        let absent_blink = positive_duration(
            "indicator.absent_blink_seconds",
            file.indicator.absent_blink_seconds,
            &mut errors,
        );

        let pins = PinLayout {
            indicator: file.pins.indicator,
            relay: file.pins.relay,
            buzzer: file.pins.buzzer,
            trigger: file.pins.trigger,
        };
        let mut seen = HashSet::new();
        for (field, spec) in [
            ("pins.indicator", pins.indicator),
            ("pins.relay", pins.relay),
            ("pins.buzzer", pins.buzzer),
            ("pins.trigger", pins.trigger),
        ] {
            if !seen.insert(spec.pin) {
                errors.push(FieldError::new(field, format!("pin {} is already bound", spec.pin)));
            }
        }

        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }

        Ok(Settings {
            devices,
            scan_interval,
            absence_timeout,
            probe_timeout,
            relay_pulse,
            arrival_beep,
            departure_beep,
            trigger_debounce,
            trigger_poll_interval,
            present_blink,
            absent_blink,
            pins,
        })
    }
}

impl From<&Settings> for SettingsFile {
    fn from(settings: &Settings) -> Self {
        let beep = |pattern: BeepPattern| BeepPatternConfig {
            duration_seconds: pattern.duration.as_secs_f64(),
            count: i64::from(pattern.count),
        };
        SettingsFile {
            presence: PresenceConfig {
                devices: settings.devices.iter().map(ToString::to_string).collect(),
                scan_interval_seconds: settings.scan_interval.as_secs_f64(),
                absence_timeout_seconds: settings.absence_timeout.as_secs_f64(),
                probe_timeout_seconds: settings.probe_timeout.as_secs_f64(),
            },
            relay: RelayConfig {
                pulse_seconds: settings.relay_pulse.as_secs_f64(),
            },
            beep: BeepConfig {
                arrival: beep(settings.arrival_beep),
                departure: beep(settings.departure_beep),
            },
            trigger: TriggerConfig {
                debounce_seconds: settings.trigger_debounce.as_secs_f64(),
                poll_interval_seconds: settings.trigger_poll_interval.as_secs_f64(),
            },
            indicator: IndicatorConfig {
                present_blink_seconds: settings.present_blink.as_secs_f64(),
                absent_blink_seconds: settings.absent_blink.as_secs_f64(),
            },
            pins: PinConfig {
                indicator: settings.pins.indicator,
                relay: settings.pins.relay,
                buzzer: settings.pins.buzzer,
                trigger: settings.pins.trigger,
            },
        }
    }
}

fn parse_field<T: std::str::FromStr>(key: &str, value: &str, errors: &mut Vec<FieldError>) -> Option<T> {
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            errors.push(FieldError::new(key, format!("cannot parse `{value}`")));
            None
        }
    }
}

impl SettingsFile {
    /// Applies `key=value` pairs as submitted by a settings form. Keys are
    /// the dotted field paths (`presence.scan_interval_seconds`); the device
    /// list is comma separated. Every unparseable or unknown field is
    /// reported, and `self` is left untouched unless all of them parse.
    /// The form itself is served outside this binary.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn apply_form<'a, I>(&mut self, fields: I) -> Result<(), ValidationErrors>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut next = self.clone();
        let mut errors = Vec::new();

        for (key, value) in fields {
            match key {
                "presence.devices" => {
                    next.presence.devices = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "presence.scan_interval_seconds" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.presence.scan_interval_seconds = v;
                    }
                }
                "presence.absence_timeout_seconds" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.presence.absence_timeout_seconds = v;
                    }
                }
                "presence.probe_timeout_seconds" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.presence.probe_timeout_seconds = v;
                    }
                }
                "relay.pulse_seconds" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.relay.pulse_seconds = v;
                    }
                }
                "beep.arrival.duration_seconds" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.beep.arrival.duration_seconds = v;
                    }
                }
                "beep.arrival.count" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.beep.arrival.count = v;
                    }
                }
                "beep.departure.duration_seconds" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.beep.departure.duration_seconds = v;
                    }
                }
                "beep.departure.count" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.beep.departure.count = v;
                    }
                }
                "trigger.debounce_seconds" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.trigger.debounce_seconds = v;
                    }
                }
                "trigger.poll_interval_seconds" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.trigger.poll_interval_seconds = v;
                    }
                }
                "indicator.present_blink_seconds" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.indicator.present_blink_seconds = v;
                    }
                }
                "indicator.absent_blink_seconds" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.indicator.absent_blink_seconds = v;
                    }
                }
                "pins.indicator" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.pins.indicator.pin = v;
                    }
                }
                "pins.relay" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.pins.relay.pin = v;
                    }
                }
                "pins.buzzer" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.pins.buzzer.pin = v;
                    }
                }
                "pins.trigger" => {
                    if let Some(v) = parse_field(key, value, &mut errors) {
                        next.pins.trigger.pin = v;
                    }
                }
                unknown => errors.push(FieldError::new(unknown, "unknown field")),
            }
        }

        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }
        *self = next;
        Ok(())
    }
}

impl AppConfig {
    /// Reads the configuration file, writing the defaults first if it does
    /// not exist yet.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => toml::de::from_str(&contents)
                .with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::info!("No configuration at {}, writing defaults", path.display());
                let config = AppConfig::default();
                config.save(path)?;
                Ok(config)
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Rewrites the whole file. The document is written next to the target
    /// and renamed over it so readers never see a partial file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::ser::to_string_pretty(self)?;
        let staging = path.with_extension("toml.tmp");
        fs::write(&staging, contents).with_context(|| format!("writing {}", staging.display()))?;
        fs::rename(&staging, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [presence]
            devices = ["AA:BB:CC:DD:EE:FF", "0c:15:63:df:61:2f"]
            scan_interval_seconds = 5
            absence_timeout_seconds = 20.0

            [beep.departure]
            count = 3

            [pins]
            relay = { pin = 17, active_low = true }

            [gpio]
            backend = "simulated"

            [mqtt]
            host = "localhost"
            port = 1883
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert_eq!(config.gpio.backend, GpioBackendKind::Simulated);
        assert_eq!(config.probe.backend, ProbeBackend::Hcitool);
        assert!(config.mqtt.map(|m| m.host) == Some("localhost".to_string()));

        let settings = Settings::try_from(&config.settings).unwrap();
        assert_eq!(settings.devices.len(), 2);
        assert_eq!(settings.scan_interval, Duration::from_secs(5));
        assert_eq!(settings.absence_timeout, Duration::from_secs(20));
        assert_eq!(settings.departure_beep.count, 3);
        assert_eq!(settings.arrival_beep.count, 2);
        assert_eq!(settings.pins.relay, PinSpec::new(17, true));
        assert_eq!(settings.pins.indicator, PinSpec::new(23, false));
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::try_from(&SettingsFile::default()).unwrap();
        assert_eq!(settings.scan_interval, Duration::from_secs(7));
        assert_eq!(settings.relay_pulse, Duration::from_millis(500));
        assert_eq!(settings.blink_interval(true), Duration::from_millis(700));
        assert_eq!(settings.blink_interval(false), Duration::from_millis(1200));
    }

    #[test]
    fn test_negative_scan_interval_rejected() {
        let mut file = SettingsFile::default();
        file.presence.scan_interval_seconds = -1.0;
        let err = Settings::try_from(&file).unwrap_err();
        assert_eq!(err.fields().collect::<Vec<_>>(), vec!["presence.scan_interval_seconds"]);
    }

    #[test]
    fn test_every_offending_field_reported() {
        let mut file = SettingsFile::default();
        file.presence.devices = vec!["not-a-mac".to_string()];
        file.relay.pulse_seconds = 0.0;
        file.beep.arrival.count = 0;
        file.indicator.absent_blink_seconds = f64::NAN;
        file.pins.buzzer.pin = file.pins.relay.pin;
        let err = Settings::try_from(&file).unwrap_err();
        let fields: Vec<_> = err.fields().collect();
        assert_eq!(
            fields,
            vec![
                "presence.devices",
                "relay.pulse_seconds",
                "beep.arrival.count",
                "indicator.absent_blink_seconds",
                "pins.buzzer",
            ]
        );
    }

    #[test]
    fn test_absence_timeout_shorter_than_scan() {
        let mut file = SettingsFile::default();
        file.presence.absence_timeout_seconds = 3.0;
        let err = Settings::try_from(&file).unwrap_err();
        assert_eq!(err.fields().collect::<Vec<_>>(), vec!["presence.absence_timeout_seconds"]);
    }

    #[test]
    fn test_empty_device_list() {
        let mut file = SettingsFile::default();
        file.presence.devices.clear();
        assert!(Settings::try_from(&file).is_err());
    }

    #[test]
    fn test_apply_form() {
        let mut file = SettingsFile::default();
        file.apply_form([
            ("presence.devices", "AA:BB:CC:DD:EE:FF, 11:22:33:44:55:66"),
            ("relay.pulse_seconds", "1.5"),
            ("beep.departure.count", "4"),
        ])
        .unwrap();
        assert_eq!(file.presence.devices.len(), 2);
        assert_eq!(file.relay.pulse_seconds, 1.5);
        assert_eq!(file.beep.departure.count, 4);
    }

    #[test]
    fn test_apply_form_reports_unparseable_fields() {
        let mut file = SettingsFile::default();
        let before = file.clone();
        let err = file
            .apply_form([
                ("presence.scan_interval_seconds", "soon"),
                ("relay.pulse_seconds", "2"),
                ("pins.relay", "-4"),
                ("colour", "red"),
            ])
            .unwrap_err();
        assert_eq!(
            err.fields().collect::<Vec<_>>(),
            vec!["presence.scan_interval_seconds", "pins.relay", "colour"]
        );
        assert_eq!(file, before);
    }

    #[test]
    fn test_settings_round_trip_through_file() {
        let settings = Settings::try_from(&SettingsFile::default()).unwrap();
        let file = SettingsFile::from(&settings);
        let text = toml::ser::to_string_pretty(&AppConfig {
            settings: file,
            ..AppConfig::default()
        })
        .unwrap();
        let parsed: AppConfig = toml::de::from_str(&text).unwrap();
        assert_eq!(Settings::try_from(&parsed.settings).unwrap(), settings);
    }
}
