//! Core reading types for minewatch.
//!
//! This module defines the fundamental data structures for representing one
//! helmet's instantaneous environmental measurements and where they came from.

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    /// Received from a helmet over the broker.
    Live,
    /// Synthesized by the fallback generator.
    Simulated,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Simulated => write!(f, "SIMULATED"),
        }
    }
}

/// One of the six measured environmental dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Carbon dioxide, ppm.
    Co2,
    /// Methane, percent by volume.
    Ch4,
    /// Oxygen, percent by volume.
    O2,
    /// Hydrogen sulfide, ppm.
    H2s,
    /// Temperature, degrees Celsius.
    Temp,
    /// Relative humidity, percent.
    Humidity,
}

impl Dimension {
    /// All dimensions, in wire and feature-vector order.
    pub const ALL: [Dimension; 6] = [
        Self::Co2,
        Self::Ch4,
        Self::O2,
        Self::H2s,
        Self::Temp,
        Self::Humidity,
    ];

    /// The payload field name for this dimension.
    #[must_use]
    pub const fn field(self) -> &'static str {
        match self {
            Self::Co2 => "co2",
            Self::Ch4 => "ch4",
            Self::O2 => "o2",
            Self::H2s => "h2s",
            Self::Temp => "temp",
            Self::Humidity => "humidity",
        }
    }

    /// Unit suffix used in log and alert messages.
    #[must_use]
    pub const fn unit(self) -> &'static str {
        match self {
            Self::Co2 | Self::H2s => "ppm",
            Self::Ch4 | Self::O2 | Self::Humidity => "%",
            Self::Temp => "°C",
        }
    }

    /// Hard physical bounds. Values outside these are sensor faults, not readings.
    #[must_use]
    pub const fn physical_range(self) -> RangeInclusive<f64> {
        match self {
            Self::Co2 => 0.0..=100_000.0,
            Self::Ch4 | Self::O2 | Self::Humidity => 0.0..=100.0,
            Self::H2s => 0.0..=2_000.0,
            Self::Temp => -50.0..=150.0,
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.field())
    }
}

/// The six scalar values of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorValues {
    /// Carbon dioxide, ppm.
    pub co2: f64,
    /// Methane, percent.
    pub ch4: f64,
    /// Oxygen, percent.
    pub o2: f64,
    /// Hydrogen sulfide, ppm.
    pub h2s: f64,
    /// Temperature, °C.
    pub temp: f64,
    /// Relative humidity, percent.
    pub humidity: f64,
}

impl SensorValues {
    /// Get the value for one dimension.
    #[must_use]
    pub const fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Co2 => self.co2,
            Dimension::Ch4 => self.ch4,
            Dimension::O2 => self.o2,
            Dimension::H2s => self.h2s,
            Dimension::Temp => self.temp,
            Dimension::Humidity => self.humidity,
        }
    }

    /// Set the value for one dimension.
    pub fn set(&mut self, dimension: Dimension, value: f64) {
        match dimension {
            Dimension::Co2 => self.co2 = value,
            Dimension::Ch4 => self.ch4 = value,
            Dimension::O2 => self.o2 = value,
            Dimension::H2s => self.h2s = value,
            Dimension::Temp => self.temp = value,
            Dimension::Humidity => self.humidity = value,
        }
    }

    /// The values as a feature vector, ordered as [`Dimension::ALL`].
    #[must_use]
    pub fn to_features(&self) -> [f64; 6] {
        Dimension::ALL.map(|d| self.get(d))
    }

    /// Check that every value is finite and inside its physical range.
    #[must_use]
    pub fn is_plausible(&self) -> bool {
        Dimension::ALL.iter().all(|&d| {
            let v = self.get(d);
            v.is_finite() && d.physical_range().contains(&v)
        })
    }
}

/// One helmet's instantaneous measurement set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Stable helmet identifier.
    pub helmet_id: String,

    /// The measured values.
    #[serde(flatten)]
    pub values: SensorValues,

    /// When the measurement was taken.
    pub timestamp: DateTime<Utc>,

    /// Provenance of this reading.
    pub source: Source,
}

impl Reading {
    /// Create a live reading.
    #[must_use]
    pub fn live(helmet_id: impl Into<String>, values: SensorValues, timestamp: DateTime<Utc>) -> Self {
        Self {
            helmet_id: helmet_id.into(),
            values,
            timestamp,
            source: Source::Live,
        }
    }

    /// Create a simulated reading.
    #[must_use]
    pub fn simulated(
        helmet_id: impl Into<String>,
        values: SensorValues,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            helmet_id: helmet_id.into(),
            values,
            timestamp,
            source: Source::Simulated,
        }
    }

    /// Check if this reading came from a helmet.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.source == Source::Live
    }
}

#[cfg(test)]
pub(crate) fn sample_values() -> SensorValues {
    SensorValues {
        co2: 420.0,
        ch4: 0.8,
        o2: 20.5,
        h2s: 3.0,
        temp: 28.0,
        humidity: 72.0,
    }
}
