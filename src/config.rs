//! Configuration using Figment
//!
//! Settings are loaded from a TOML file, then overridden by environment variables
//! prefixed with `ERPES_`. Nested keys are separated by a double underscore:
//!
//! ```text
//! ERPES_APPLICATION__LOG_LEVEL=debug
//! ERPES_POLLING__PERIOD=2s
//! ERPES_EXCHANGE__BIND=0.0.0.0:5557
//! ```
//!
//! Durations are written human-readable (`"250ms"`, `"5s"`).
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "ARPES DAQ"
//! log_level = "info"
//!
//! [scan]
//! capture = ["TB", "torr_main", "x", "slit_number"]
//!
//! [[instruments]]
//! id = "gauges"
//! kind = "mg15"
//! link = { type = "modbus_tcp", address = "192.168.0.20:502" }
//!
//! [[instruments]]
//! id = "compressor"
//! kind = "f70h"
//! period = "5s"
//! link = { type = "serial", port = "/dev/ttyUSB0", baud_rate = 9600, framing = { write_terminator = "\r", read_terminator = "\r" } }
//! ```

use crate::adapters::Framing;
use crate::alarm::Predicate;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{BackoffPolicy, RetryPolicy};
use crate::instruments::mg15::GaugeChannel;
use crate::instruments::QueryChannel;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Process name and log level
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Attribute store settings
    #[serde(default)]
    pub store: StoreConfig,
    /// Defaults for every polling engine
    #[serde(default)]
    pub polling: PollingConfig,
    /// Attribute exchange listener
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// End-of-scan capture
    #[serde(default)]
    pub scan: ScanConfig,
    /// Polled instruments
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
    /// Alarm conditions; compressor defaults apply when empty
    #[serde(default)]
    pub alarms: Vec<AlarmConfig>,
    /// Stage motion queue
    #[serde(default)]
    pub motion: Option<MotionConfig>,
    /// Analyzer slit indicator
    #[serde(default)]
    pub slit: Option<SlitConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Attribute store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Readings older than this read as invalid; unset disables age-based staleness
    #[serde(default, with = "humantime_serde")]
    pub staleness_window: Option<Duration>,
}

/// Defaults for every polling engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Polling period
    #[serde(default = "default_period", with = "humantime_serde")]
    pub period: Duration,
    /// Bound on each link transaction
    #[serde(default = "default_transaction_timeout", with = "humantime_serde")]
    pub transaction_timeout: Duration,
    /// Backoff growth per consecutive failure
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Backoff cap
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Consecutive failures before an instrument's attributes are marked stale
    #[serde(default = "default_stale_after_failures")]
    pub stale_after_failures: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            period: default_period(),
            transaction_timeout: default_transaction_timeout(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max: default_backoff_max(),
            stale_after_failures: default_stale_after_failures(),
        }
    }
}

impl PollingConfig {
    /// Backoff policy for a loop polling every `period`.
    pub fn backoff(&self, period: Duration) -> BackoffPolicy {
        BackoffPolicy {
            base: period,
            max: self.backoff_max.max(period),
            multiplier: self.backoff_multiplier,
        }
    }
}

/// Exchange server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// A connection idle (or stalled writing) this long is closed
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Longest accepted request line, in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            idle_timeout: default_idle_timeout(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// Scan orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Attributes captured at the end of every scan
    #[serde(default)]
    pub capture: Vec<String>,
    /// Capture attempts before the scan fails
    #[serde(default = "default_capture_attempts")]
    pub capture_attempts: u32,
    /// Delay between capture attempts
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Accept invalid (stale) readings in the captured snapshot
    #[serde(default)]
    pub allow_stale: bool,
    /// Capture from a remote exchange server instead of the local store
    #[serde(default)]
    pub source: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            capture: Vec::new(),
            capture_attempts: default_capture_attempts(),
            retry_delay: default_retry_delay(),
            allow_stale: false,
            source: None,
        }
    }
}

impl ScanConfig {
    /// Retry policy for snapshot capture.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.capture_attempts,
            backoff_delay: self.retry_delay,
        }
    }
}

/// Instrument families with a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Generic query/regex driver
    Query,
    /// Sumitomo F70H compressor
    F70h,
    /// MG15 vacuum gauge controller
    Mg15,
    /// Another process's exchange server
    Mirror,
}

/// How to reach an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkConfig {
    /// RS-232
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default)]
        framing: Framing,
    },
    /// ASCII over TCP
    Tcp {
        address: String,
        #[serde(default)]
        framing: Framing,
    },
    /// Modbus TCP
    ModbusTcp {
        address: SocketAddr,
        #[serde(default = "default_unit")]
        unit: u8,
    },
    /// Modbus RTU (requires the `tokio_serial` feature)
    ModbusRtu {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_unit")]
        unit: u8,
    },
    /// Exchange protocol client
    Exchange { address: String },
    /// In-process simulation of the instrument
    Simulate,
}

/// One polled instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Unique identifier
    pub id: String,
    /// Driver
    pub kind: InstrumentKind,
    /// Connection
    pub link: LinkConfig,
    /// Overrides `polling.period`
    #[serde(default, with = "humantime_serde")]
    pub period: Option<Duration>,
    /// `query`: one entry per attribute
    #[serde(default)]
    pub channels: Vec<QueryChannel>,
    /// `mg15`: channel mapping; empty uses the beamline default
    #[serde(default)]
    pub gauges: Vec<GaugeChannel>,
    /// `mirror`: attributes to fetch; empty fetches all
    #[serde(default)]
    pub names: Vec<String>,
}

/// One alarm condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    /// Unique alarm name
    pub name: String,
    /// Watched attribute
    pub attribute: String,
    /// Condition under which the alarm is active
    pub predicate: Predicate,
    /// Consecutive evaluations required for a transition
    #[serde(default = "default_debounce")]
    pub debounce: u32,
    /// Notification text; defaults to the alarm name
    #[serde(default)]
    pub message: Option<String>,
}

/// Motion stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Instrument id of the stage; its link carries the move commands
    pub instrument: String,
    /// Move command template with `{axis}`, `{target}` and `{uid}` placeholders
    #[serde(default = "default_move_template")]
    pub command_template: String,
    /// How often completion is checked against the store
    #[serde(default = "default_settle_poll", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Controlled axes
    pub axes: Vec<AxisConfig>,
}

/// One stage axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Axis name used by callers (e.g. "x", "polar")
    pub name: String,
    /// Controller-side axis identifier; defaults to the name
    #[serde(default)]
    pub channel: Option<String>,
    /// Attribute holding the axis read-back position
    pub position_attribute: String,
    /// Position tolerance for completion
    pub tolerance: f64,
    /// Time the position must stay within tolerance
    #[serde(default = "default_stability_window", with = "humantime_serde")]
    pub stability_window: Duration,
    /// Move timeout
    #[serde(default = "default_move_timeout", with = "humantime_serde")]
    pub move_timeout: Duration,
    /// Lower soft limit
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper soft limit
    #[serde(default)]
    pub max: Option<f64>,
}

/// Analyzer slit configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlitConfig {
    /// Slit number selected at startup
    #[serde(default)]
    pub initial: Option<u32>,
}

fn default_name() -> String {
    "erpes-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_period() -> Duration {
    Duration::from_secs(1)
}

fn default_transaction_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

fn default_stale_after_failures() -> u32 {
    3
}

fn default_bind() -> String {
    "127.0.0.1:5557".to_string()
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_line_length() -> usize {
    4096
}

fn default_capture_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_unit() -> u8 {
    1
}

fn default_debounce() -> u32 {
    2
}

fn default_move_template() -> String {
    "MOVE {axis},{target}".to_string()
}

fn default_settle_poll() -> Duration {
    Duration::from_millis(100)
}

fn default_stability_window() -> Duration {
    Duration::from_millis(500)
}

fn default_move_timeout() -> Duration {
    Duration::from_secs(60)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from a specific file path
    ///
    /// Environment variables (`ERPES_` prefix) take precedence over the file.
    /// After loading, configuration is validated.
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Config` if the file cannot be parsed and
    /// `DaqError::Configuration` if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("ERPES_").split("__")),
        )
    }

    /// Parse a TOML document (no environment overlay).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Instrument IDs are unique and each kind has a usable link
    /// - Alarm names are unique and debounce is at least 1
    /// - The motion stage refers to a configured instrument, axis names are unique,
    ///   tolerances are positive and soft limits are ordered
    /// - The scan capture set is not empty
    /// - Polling period is non-zero and backoff multiplier is at least 1
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.polling.backoff_multiplier < 1.0 {
            return Err(invalid(format!(
                "polling.backoff_multiplier must be >= 1, got {}",
                self.polling.backoff_multiplier
            )));
        }
        if self.polling.period.is_zero() {
            return Err(invalid("polling.period must be > 0".into()));
        }
        if self.polling.stale_after_failures == 0 {
            return Err(invalid("polling.stale_after_failures must be >= 1".into()));
        }
        if self.polling.transaction_timeout.is_zero() {
            return Err(invalid("polling.transaction_timeout must be > 0".into()));
        }
        if self.exchange.max_line_length == 0 {
            return Err(invalid("exchange.max_line_length must be > 0".into()));
        }

        if self.scan.capture.is_empty() {
            return Err(invalid("scan.capture must name at least one attribute".into()));
        }
        if self.scan.capture_attempts == 0 {
            return Err(invalid("scan.capture_attempts must be >= 1".into()));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(instrument.id.as_str()) {
                return Err(invalid(format!("Duplicate instrument ID: '{}'", instrument.id)));
            }
            validate_instrument(instrument)?;
        }

        let mut alarm_names = HashSet::new();
        for alarm in &self.alarms {
            if !alarm_names.insert(alarm.name.as_str()) {
                return Err(invalid(format!("Duplicate alarm name: '{}'", alarm.name)));
            }
            if alarm.debounce == 0 {
                return Err(invalid(format!("Alarm '{}': debounce must be >= 1", alarm.name)));
            }
        }

        if let Some(motion) = &self.motion {
            if !ids.contains(motion.instrument.as_str()) {
                return Err(invalid(format!(
                    "motion.instrument '{}' is not a configured instrument",
                    motion.instrument
                )));
            }
            let mut axes = HashSet::new();
            for axis in &motion.axes {
                if !axes.insert(axis.name.as_str()) {
                    return Err(invalid(format!("Duplicate axis name: '{}'", axis.name)));
                }
                if !(axis.tolerance > 0.0) {
                    return Err(invalid(format!(
                        "Axis '{}': tolerance must be > 0",
                        axis.name
                    )));
                }
                if let (Some(min), Some(max)) = (axis.min, axis.max) {
                    if min > max {
                        return Err(invalid(format!(
                            "Axis '{}': min {min} exceeds max {max}",
                            axis.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Polling period of `instrument`.
    pub fn period_of(&self, instrument: &InstrumentConfig) -> Duration {
        instrument.period.unwrap_or(self.polling.period)
    }
}

fn invalid(message: String) -> DaqError {
    DaqError::Configuration(message)
}

fn validate_instrument(instrument: &InstrumentConfig) -> AppResult<()> {
    let link_ok = match instrument.kind {
        InstrumentKind::Query | InstrumentKind::F70h => matches!(
            instrument.link,
            LinkConfig::Serial { .. } | LinkConfig::Tcp { .. } | LinkConfig::Simulate
        ),
        InstrumentKind::Mg15 => matches!(
            instrument.link,
            LinkConfig::ModbusTcp { .. } | LinkConfig::ModbusRtu { .. } | LinkConfig::Simulate
        ),
        InstrumentKind::Mirror => matches!(instrument.link, LinkConfig::Exchange { .. }),
    };
    if !link_ok {
        return Err(invalid(format!(
            "Instrument '{}': link type does not fit kind {:?}",
            instrument.id, instrument.kind
        )));
    }
    if instrument.kind == InstrumentKind::Query && instrument.channels.is_empty() {
        return Err(invalid(format!(
            "Query instrument '{}' has no channels",
            instrument.id
        )));
    }
    if instrument.period.is_some_and(|p| p.is_zero()) {
        return Err(invalid(format!(
            "Instrument '{}': period must be > 0",
            instrument.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[scan]
capture = ["TB", "torr_main"]

[[instruments]]
id = "gauges"
kind = "mg15"
link = { type = "modbus_tcp", address = "127.0.0.1:502" }

[[instruments]]
id = "tempcontroller"
kind = "query"
period = "2s"
link = { type = "serial", port = "/dev/ttyUSB1", baud_rate = 57600 }

[[instruments.channels]]
attribute = "TB"
command = "KRDG? B"
unit = "K"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let settings = Settings::from_toml_str(MINIMAL).unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.polling.stale_after_failures, 3);
        assert_eq!(settings.exchange.idle_timeout, Duration::from_secs(5));
        assert_eq!(settings.scan.capture_attempts, 3);
        assert!(!settings.scan.allow_stale);
        assert_eq!(settings.instruments.len(), 2);
        assert_eq!(
            settings.period_of(&settings.instruments[1]),
            Duration::from_secs(2)
        );
        assert_eq!(settings.period_of(&settings.instruments[0]), Duration::from_secs(1));
        assert!(matches!(
            settings.instruments[1].link,
            LinkConfig::Serial { baud_rate: 57600, .. }
        ));
    }

    #[test]
    fn test_duplicate_instrument_rejected() {
        let doc = format!(
            "{MINIMAL}\n[[instruments]]\nid = \"gauges\"\nkind = \"f70h\"\nlink = {{ type = \"simulate\" }}\n"
        );
        let err = Settings::from_toml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument ID"));
    }

    #[test]
    fn test_link_must_fit_kind() {
        let doc = r#"
[scan]
capture = ["x"]

[[instruments]]
id = "gauges"
kind = "mg15"
link = { type = "serial", port = "/dev/ttyUSB0" }
"#;
        assert!(matches!(
            Settings::from_toml_str(doc),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_capture_set_rejected() {
        let err = Settings::from_toml_str("[application]\nname = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("scan.capture"));
    }

    #[test]
    fn test_zero_polling_period_rejected() {
        let doc = "[polling]\nperiod = \"0s\"\n\n[scan]\ncapture = [\"x\"]\n";
        let err = Settings::from_toml_str(doc).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(err.to_string().contains("polling.period"));
    }

    #[test]
    fn test_alarm_and_motion_validation() {
        let doc = format!(
            r#"{MINIMAL}
[[alarms]]
name = "pressure"
attribute = "torr_main"
predicate = {{ type = "above", threshold = 1e-8 }}
debounce = 0
"#
        );
        let err = Settings::from_toml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("debounce"));

        let doc = format!(
            r#"{MINIMAL}
[motion]
instrument = "stage"
axes = []
"#
        );
        let err = Settings::from_toml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("motion.instrument"));
    }

    #[test]
    fn test_load_from_file_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("ERPES_POLLING__PERIOD", "250ms");
            let settings = Settings::load_from(file.path()).map_err(|e| e.to_string())?;
            assert_eq!(settings.polling.period, Duration::from_millis(250));
            Ok(())
        });
    }

    #[test]
    fn test_example_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/erpes.example.toml");
        let settings = Settings::load_from(path).unwrap();
        assert_eq!(settings.instruments.len(), 4);
        assert_eq!(settings.motion.as_ref().unwrap().axes.len(), 3);
        assert_eq!(settings.period_of(&settings.instruments[0]), Duration::from_secs(5));
        assert!(matches!(
            settings.alarms[2].predicate,
            crate::alarm::Predicate::Stale
        ));
    }
}
