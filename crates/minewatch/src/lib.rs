//! `minewatch` - real-time helmet telemetry pipeline for underground mines
//!
//! Helmets publish gas and environment readings over MQTT. This library
//! decodes them into a bounded per-helmet store, substitutes simulated
//! readings for helmets that have gone quiet, grades every helmet against a
//! threshold table and publishes a consolidated snapshot once per tick.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod aggregator;
pub mod alerts;
pub mod cli;
pub mod codec;
pub mod config;
pub mod delegate;
pub mod error;
pub mod listener;
pub mod logging;
pub mod pipeline;
pub mod publisher;
pub mod reading;
pub mod risk;
pub mod server;
pub mod shutdown;
pub mod simulate;
pub mod snapshot;
pub mod store;

pub use aggregator::Aggregator;
pub use codec::{decode, encode, DecodeError};
pub use config::{Config, RosterEntry};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use pipeline::{Pipeline, PipelineHandle};
pub use reading::{Dimension, Reading, SensorValues, Source};
pub use risk::{classify, Assessment, RiskLevel, ThresholdTable};
pub use shutdown::ShutdownHandle;
pub use snapshot::{HelmetStatus, Snapshot, SnapshotReader};
pub use store::HelmetStore;
