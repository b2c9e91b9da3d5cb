//! Synthetic fallback readings.
//!
//! When a helmet has gone quiet the aggregator substitutes a simulated
//! reading so the dashboard keeps moving. Values are drawn from baseline
//! ranges typical of a working coal seam, with occasional spikes, and are
//! clamped to plausible sensor bounds.

use std::hash::{Hash, Hasher};
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::reading::{Dimension, Reading, SensorValues};

/// How one dimension is simulated.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    /// Range the baseline value is drawn from.
    pub baseline: RangeInclusive<f64>,
    /// Symmetric jitter added to the baseline.
    pub jitter: f64,
    /// Chance of a spike, in `[0, 1]`.
    pub spike_chance: f64,
    /// Range of the spike added on top.
    pub spike: RangeInclusive<f64>,
    /// Output is clamped into this range.
    pub bounds: RangeInclusive<f64>,
    /// Decimal places kept.
    pub precision: i32,
}

impl Profile {
    /// The default profile for a dimension.
    #[must_use]
    pub fn for_dimension(dimension: Dimension) -> Self {
        match dimension {
            Dimension::Co2 => Self {
                baseline: 350.0..=600.0,
                jitter: 20.0,
                spike_chance: 0.10,
                spike: 200.0..=500.0,
                bounds: 200.0..=2_000.0,
                precision: 1,
            },
            Dimension::Ch4 => Self {
                baseline: 0.3..=1.2,
                jitter: 0.1,
                spike_chance: 0.05,
                spike: 0.5..=1.5,
                bounds: 0.0..=5.0,
                precision: 2,
            },
            Dimension::O2 => Self {
                baseline: 19.5..=20.9,
                jitter: 0.2,
                spike_chance: 0.0,
                spike: 0.0..=0.0,
                bounds: 16.0..=23.0,
                precision: 1,
            },
            Dimension::H2s => Self {
                baseline: 0.0..=8.0,
                jitter: 1.0,
                spike_chance: 0.08,
                spike: 5.0..=15.0,
                bounds: 0.0..=50.0,
                precision: 1,
            },
            Dimension::Temp => Self {
                baseline: 24.0..=35.0,
                jitter: 2.0,
                spike_chance: 0.0,
                spike: 0.0..=0.0,
                bounds: 15.0..=45.0,
                precision: 1,
            },
            Dimension::Humidity => Self {
                baseline: 60.0..=85.0,
                jitter: 5.0,
                spike_chance: 0.0,
                spike: 0.0..=0.0,
                bounds: 30.0..=95.0,
                precision: 1,
            },
        }
    }

    fn sample(&self, rng: &mut impl Rng) -> f64 {
        let mut value = rng.gen_range(self.baseline.clone());
        if self.spike_chance > 0.0 && rng.gen_bool(self.spike_chance.min(1.0)) {
            value += rng.gen_range(self.spike.clone());
        }
        if self.jitter > 0.0 {
            value += rng.gen_range(-self.jitter..=self.jitter);
        }
        let value = value.clamp(*self.bounds.start(), *self.bounds.end());
        let scale = 10f64.powi(self.precision);
        (value * scale).round() / scale
    }
}

/// Produces simulated readings.
///
/// Each reading is derived from a seed mixed with the helmet id and tick, so
/// a fixed seed replays the same sequence.
#[derive(Debug, Clone)]
pub struct SimulationGenerator {
    seed: u64,
    profiles: [Profile; 6],
}

impl SimulationGenerator {
    /// Create a generator with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            profiles: Dimension::ALL.map(Profile::for_dimension),
        }
    }

    /// Create a generator seeded from the OS.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self::new(rand::random())
    }

    /// Generate a simulated reading for `helmet_id` at aggregation `tick`.
    #[must_use]
    pub fn generate(&self, helmet_id: &str, tick: u64, now: DateTime<Utc>) -> Reading {
        let mut rng = StdRng::seed_from_u64(self.mix(helmet_id, tick));
        let mut values = SensorValues {
            co2: 0.0,
            ch4: 0.0,
            o2: 0.0,
            h2s: 0.0,
            temp: 0.0,
            humidity: 0.0,
        };
        for (dimension, profile) in Dimension::ALL.iter().zip(&self.profiles) {
            values.set(*dimension, profile.sample(&mut rng));
        }
        Reading::simulated(helmet_id, values, now)
    }

    fn mix(&self, helmet_id: &str, tick: u64) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.seed.hash(&mut hasher);
        helmet_id.hash(&mut hasher);
        tick.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for SimulationGenerator {
    fn default() -> Self {
        Self::from_entropy()
    }
}
