//! Published snapshots.
//!
//! A [`Snapshot`] is built in full by the aggregator and then swapped in
//! behind an `Arc`, so readers only ever see complete ticks.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::RosterEntry;
use crate::reading::{Dimension, Reading, Source};
use crate::risk::{Assessment, RiskLevel};

/// One helmet's entry in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelmetStatus {
    /// The reading used for this tick.
    pub reading: Reading,
    /// Overall risk level.
    pub risk: RiskLevel,
    /// Provenance of the reading.
    pub source: Source,
    /// Per-dimension levels.
    pub dimensions: BTreeMap<Dimension, RiskLevel>,
    /// Advisory model label, if a model was consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_label: Option<String>,
    /// When the helmet last reported live.
    pub last_live_at: Option<DateTime<Utc>>,
    /// Miner wearing the helmet, for rostered helmets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miner: Option<String>,
    /// Where the miner is stationed, for rostered helmets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl HelmetStatus {
    /// Combine a reading with its assessment.
    #[must_use]
    pub fn new(reading: Reading, assessment: Assessment, last_live_at: Option<DateTime<Utc>>) -> Self {
        Self {
            source: reading.source,
            reading,
            risk: assessment.level,
            dimensions: assessment.dimensions,
            model_label: assessment.model_label,
            last_live_at,
            miner: None,
            location: None,
        }
    }

    /// Attach the miner and location from a roster entry.
    #[must_use]
    pub fn with_roster_entry(mut self, entry: &RosterEntry) -> Self {
        self.miner.clone_from(&entry.miner);
        self.location.clone_from(&entry.location);
        self
    }
}

/// Helmet counts by level and by source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Summary {
    /// Helmets in the snapshot.
    pub total: usize,
    /// Helmets at SAFE.
    pub safe: usize,
    /// Helmets at WARNING.
    pub warning: usize,
    /// Helmets at DANGER.
    pub danger: usize,
    /// Helmets reporting live.
    pub live: usize,
    /// Helmets on simulated data.
    pub simulated: usize,
}

impl Summary {
    fn tally<'a>(statuses: impl IntoIterator<Item = &'a HelmetStatus>) -> Self {
        statuses.into_iter().fold(Self::default(), |mut acc, status| {
            acc.total += 1;
            match status.risk {
                RiskLevel::Safe => acc.safe += 1,
                RiskLevel::Warning => acc.warning += 1,
                RiskLevel::Danger => acc.danger += 1,
            }
            match status.source {
                Source::Live => acc.live += 1,
                Source::Simulated => acc.simulated += 1,
            }
            acc
        })
    }
}

/// Whole-system view at one aggregation tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Tick number; 0 before the first aggregation.
    pub tick: u64,
    /// When the snapshot was assembled.
    pub generated_at: DateTime<Utc>,
    /// Entries keyed by helmet id.
    pub helmets: BTreeMap<String, HelmetStatus>,
    /// Counts over `helmets`.
    pub summary: Summary,
}

impl Snapshot {
    /// Build a snapshot, computing its summary.
    #[must_use]
    pub fn new(tick: u64, generated_at: DateTime<Utc>, helmets: BTreeMap<String, HelmetStatus>) -> Self {
        let summary = Summary::tally(helmets.values());
        Self {
            tick,
            generated_at,
            helmets,
            summary,
        }
    }

    /// The snapshot served before the first tick.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(0, Utc::now(), BTreeMap::new())
    }

    /// Look up one helmet.
    #[must_use]
    pub fn get(&self, helmet_id: &str) -> Option<&HelmetStatus> {
        self.helmets.get(helmet_id)
    }
}

/// Write side of the snapshot channel, owned by the aggregator.
#[derive(Debug)]
pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<Snapshot>>,
}

/// Read side of the snapshot channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Arc<Snapshot>>,
}

/// Create a publisher/reader pair seeded with [`Snapshot::empty`].
#[must_use]
pub fn channel() -> (SnapshotPublisher, SnapshotReader) {
    let (tx, rx) = watch::channel(Arc::new(Snapshot::empty()));
    (SnapshotPublisher { tx }, SnapshotReader { rx })
}

impl SnapshotPublisher {
    /// Replace the current snapshot.
    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.tx.send_replace(Arc::clone(&snapshot));
        snapshot
    }

    /// A new reader of this channel.
    #[must_use]
    pub fn subscribe(&self) -> SnapshotReader {
        SnapshotReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl SnapshotReader {
    /// The latest published snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait for the next snapshot. Returns `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<Arc<Snapshot>> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }
}
