//! Core data types shared by every component of the telemetry core.
//!
//! An [`Attribute`] is one named, timestamped sensor or setpoint value. Attributes
//! flow from the polling engines into the [`AttributeStore`](crate::store::AttributeStore)
//! and from there to the exchange server, the alarm engine and the scan orchestrator.
//!
//! # Data Flow
//!
//! ```text
//! LinkAdapter --raw reply--> InstrumentDriver --Vec<Attribute>--> AttributeStore
//!                                                          |--> ExchangeServer
//!                                                          |--> AlarmEngine
//!                                                          '--> ScanOrchestrator
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Value carried by an attribute: numeric readings or free text (states, labels).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Numeric reading, normalized to f64
    Number(f64),
    /// Textual reading such as an operating state
    Text(String),
}

impl AttributeValue {
    /// Returns the numeric value, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(v) => Some(*v),
            AttributeValue::Text(_) => None,
        }
    }

    /// Parse a wire value back into a value: numbers when they parse, text otherwise.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<f64>() {
            Ok(v) => AttributeValue::Number(v),
            Err(_) => AttributeValue::Text(raw.to_string()),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Number(v) => {
                let magnitude = v.abs();
                // Pressures live around 1e-10; keep them readable.
                if *v != 0.0 && v.is_finite() && !(1e-3..1e6).contains(&magnitude) {
                    write!(f, "{v:e}")
                } else {
                    write!(f, "{v}")
                }
            }
            AttributeValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Number(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

/// One named, timestamped reading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Unique name within a store (e.g., "torr_main", "TA")
    pub name: String,
    /// The reading
    pub value: AttributeValue,
    /// Physical unit, empty for dimensionless values
    pub unit: String,
    /// UTC time of the successful read that produced this value
    pub timestamp: DateTime<Utc>,
    /// False once the reading is stale or the instrument flagged it
    pub valid: bool,
}

impl Attribute {
    /// Create a valid attribute stamped with the current time.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            unit: unit.into(),
            timestamp: Utc::now(),
            valid: true,
        }
    }

    /// Replace the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mark the reading as untrustworthy.
    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }

    /// Milliseconds since the Unix epoch, as used on the exchange wire.
    pub fn epoch_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Whether the reading is older than `window` at `now`.
    pub fn is_older_than(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(window) {
            Ok(window) => now.signed_duration_since(self.timestamp) > window,
            Err(_) => false,
        }
    }
}

/// Atomic, point-in-time read of a subset of attributes, ordered by name.
pub type Snapshot = BTreeMap<String, Attribute>;
