//! Threshold-based risk classification.
//!
//! Each dimension is graded independently against a two-boundary band and the
//! overall level is the worst of the six. A single dangerous gas reading is
//! never averaged away by safe ones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reading::{Dimension, Reading, SensorValues};

/// Severity of a reading, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// Within normal working limits.
    #[default]
    Safe,
    /// Elevated; increased monitoring required.
    Warning,
    /// Immediate action required.
    Danger,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "SAFE"),
            Self::Warning => write!(f, "WARNING"),
            Self::Danger => write!(f, "DANGER"),
        }
    }
}

/// Which way a dimension becomes dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Higher values are worse (gases, heat, humidity).
    Rising,
    /// Lower values are worse (oxygen).
    Falling,
}

impl Direction {
    /// The direction for a dimension.
    #[must_use]
    pub const fn of(dimension: Dimension) -> Self {
        match dimension {
            Dimension::O2 => Self::Falling,
            _ => Self::Rising,
        }
    }
}

/// The two boundaries of one dimension.
///
/// For a rising dimension a value below `warning` is safe, below `danger` is a
/// warning, and anything else is dangerous. For a falling dimension a value
/// above `warning` is safe, above `danger` is a warning, and anything else is
/// dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    /// Boundary between safe and warning.
    pub warning: f64,
    /// Boundary between warning and danger.
    pub danger: f64,
}

impl Band {
    /// Create a band.
    #[must_use]
    pub const fn new(warning: f64, danger: f64) -> Self {
        Self { warning, danger }
    }

    /// Grade a value against this band.
    #[must_use]
    pub fn grade(&self, direction: Direction, value: f64) -> RiskLevel {
        match direction {
            Direction::Rising if value < self.warning => RiskLevel::Safe,
            Direction::Rising if value < self.danger => RiskLevel::Warning,
            Direction::Falling if value > self.warning => RiskLevel::Safe,
            Direction::Falling if value > self.danger => RiskLevel::Warning,
            _ => RiskLevel::Danger,
        }
    }
}

/// Safety thresholds for all six dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    /// Carbon dioxide, ppm.
    pub co2: Band,
    /// Methane, percent.
    pub ch4: Band,
    /// Oxygen, percent (falling).
    pub o2: Band,
    /// Hydrogen sulfide, ppm.
    pub h2s: Band,
    /// Temperature, °C.
    pub temp: Band,
    /// Relative humidity, percent.
    pub humidity: Band,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            co2: Band::new(500.0, 800.0),
            ch4: Band::new(1.0, 1.5),
            o2: Band::new(19.5, 19.0),
            h2s: Band::new(10.0, 15.0),
            temp: Band::new(30.0, 35.0),
            humidity: Band::new(80.0, 90.0),
        }
    }
}

impl ThresholdTable {
    /// Get the band for one dimension.
    #[must_use]
    pub const fn band(&self, dimension: Dimension) -> &Band {
        match dimension {
            Dimension::Co2 => &self.co2,
            Dimension::Ch4 => &self.ch4,
            Dimension::O2 => &self.o2,
            Dimension::H2s => &self.h2s,
            Dimension::Temp => &self.temp,
            Dimension::Humidity => &self.humidity,
        }
    }

    /// Check every band is finite and ordered for its direction.
    ///
    /// # Errors
    ///
    /// Returns a configuration validation error naming the first bad dimension.
    pub fn validate(&self) -> Result<()> {
        for dimension in Dimension::ALL {
            let band = self.band(dimension);
            if !band.warning.is_finite() || !band.danger.is_finite() {
                return Err(Error::config_validation(format!(
                    "thresholds.{dimension} must be finite"
                )));
            }
            let ordered = match Direction::of(dimension) {
                Direction::Rising => band.warning < band.danger,
                Direction::Falling => band.warning > band.danger,
            };
            if !ordered {
                return Err(Error::config_validation(format!(
                    "thresholds.{dimension}: warning ({}) and danger ({}) are out of order",
                    band.warning, band.danger
                )));
            }
        }
        Ok(())
    }

    /// Grade one dimension's value.
    #[must_use]
    pub fn grade(&self, dimension: Dimension, value: f64) -> RiskLevel {
        self.band(dimension).grade(Direction::of(dimension), value)
    }

    /// Classify a set of values, keeping the per-dimension breakdown.
    #[must_use]
    pub fn assess_values(&self, values: &SensorValues) -> Assessment {
        let dimensions: BTreeMap<Dimension, RiskLevel> = Dimension::ALL
            .iter()
            .map(|&d| (d, self.grade(d, values.get(d))))
            .collect();
        let level = dimensions.values().copied().max().unwrap_or_default();
        Assessment {
            level,
            dimensions,
            model_label: None,
        }
    }

    /// Classify a reading. Total over every decodable reading.
    #[must_use]
    pub fn classify(&self, reading: &Reading) -> RiskLevel {
        self.assess_values(&reading.values).level
    }
}

/// The outcome of classifying one reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    /// Worst level across all dimensions.
    pub level: RiskLevel,
    /// Level of each dimension.
    pub dimensions: BTreeMap<Dimension, RiskLevel>,
    /// Advisory label from an external model, if one was consulted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_label: Option<String>,
}

impl Assessment {
    /// Dimensions at or above the given level.
    #[must_use]
    pub fn breached(&self, at_least: RiskLevel) -> Vec<Dimension> {
        self.dimensions
            .iter()
            .filter(|(_, &level)| level >= at_least)
            .map(|(&d, _)| d)
            .collect()
    }
}

/// Classify a reading against the default threshold table.
#[must_use]
pub fn classify(reading: &Reading) -> RiskLevel {
    ThresholdTable::default().classify(reading)
}
