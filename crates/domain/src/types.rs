//! Shared value types for the sensor domain.
//!
//! Unlike the identifiers in [`crate::identifiers`], these types carry values
//! with invariants (sensor measurements are finite, statuses come from a fixed
//! vocabulary) and participate in domain computations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API. Serialises as an RFC 3339 string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Sensor measurements
// ---------------------------------------------------------------------------

/// Named sensor measurements taken at one instant.
///
/// Keys are sensor names (e.g. `"sensor_04"`); iteration order is the sorted
/// key order so serialised readings are stable. Only finite values are
/// accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorValues(BTreeMap<String, f64>);

impl SensorValues {
    /// Creates an empty set of measurements.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a measurement. Returns `false` (and records nothing) if the
    /// value is NaN or infinite.
    pub fn insert(&mut self, sensor: impl Into<String>, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        self.0.insert(sensor.into(), value);
        true
    }

    /// Returns the measurement for `sensor`, if present.
    pub fn get(&self, sensor: &str) -> Option<f64> {
        self.0.get(sensor).copied()
    }

    /// Number of sensors with a measurement.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no sensor has a measurement.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(sensor, value)` pairs in sensor-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for SensorValues {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut values = Self::new();
        for (k, v) in iter {
            values.insert(k, v);
        }
        values
    }
}

// ---------------------------------------------------------------------------
// Machine status
// ---------------------------------------------------------------------------

/// Operating status of a machine as labelled in the sensor dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    /// Operating normally.
    #[default]
    Normal,
    /// Failed; a failure episode is in progress.
    Broken,
    /// Coming back from a failure; the episode is still considered open.
    Recovering,
}

impl MachineStatus {
    /// Parses a dataset label case-insensitively (`"NORMAL"`, `"broken"`, ...).
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Some(Self::Normal),
            "BROKEN" => Some(Self::Broken),
            "RECOVERING" => Some(Self::Recovering),
            _ => None,
        }
    }

    /// Returns `true` while a failure episode is open.
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Normal)
    }

    /// The canonical dataset label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Broken => "BROKEN",
            Self::Recovering => "RECOVERING",
        }
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
