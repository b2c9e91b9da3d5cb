//! Tick-driven aggregation.
//!
//! Once per tick every helmet on the roster or seen on the feed is resolved
//! to a reading: its latest live reading if fresh, otherwise a simulated one
//! that is appended to the store. The readings are assessed concurrently and
//! the whole set is published as one [`Snapshot`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::alerts::{AlertKind, AlertLog};
use crate::config::{Config, RosterEntry};
use crate::delegate::Assessor;
use crate::reading::Reading;
use crate::risk::{Assessment, ThresholdTable};
use crate::shutdown::ShutdownHandle;
use crate::simulate::SimulationGenerator;
use crate::snapshot::{HelmetStatus, Snapshot, SnapshotPublisher};
use crate::store::HelmetStore;

/// Default tick interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Default staleness window.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(5);

/// Builds and publishes snapshots.
#[derive(Debug)]
pub struct Aggregator {
    store: Arc<HelmetStore>,
    publisher: SnapshotPublisher,
    assessor: Arc<Assessor>,
    alerts: Arc<AlertLog>,
    generator: Option<SimulationGenerator>,
    roster: BTreeMap<String, RosterEntry>,
    interval: Duration,
    staleness: Duration,
    tick: u64,
}

impl Aggregator {
    /// Create an aggregator with default timing, no roster and simulation on.
    #[must_use]
    pub fn new(store: Arc<HelmetStore>, publisher: SnapshotPublisher) -> Self {
        Self {
            store,
            publisher,
            assessor: Arc::new(Assessor::new(ThresholdTable::default())),
            alerts: Arc::new(AlertLog::default()),
            generator: Some(SimulationGenerator::default()),
            roster: BTreeMap::new(),
            interval: DEFAULT_TICK_INTERVAL,
            staleness: DEFAULT_STALENESS_WINDOW,
            tick: 0,
        }
    }

    /// Create an aggregator from configuration.
    #[must_use]
    pub fn from_config(
        config: &Config,
        store: Arc<HelmetStore>,
        publisher: SnapshotPublisher,
        assessor: Assessor,
        alerts: Arc<AlertLog>,
    ) -> Self {
        let generator = config.simulation.enabled.then(|| {
            config
                .simulation
                .seed
                .map_or_else(SimulationGenerator::from_entropy, SimulationGenerator::new)
        });
        Self::new(store, publisher)
            .with_assessor(assessor)
            .with_alerts(alerts)
            .with_generator(generator)
            .with_roster(config.pipeline.roster.clone())
            .with_interval(config.tick_interval())
            .with_staleness(config.staleness_window())
    }

    /// Set the assessor.
    #[must_use]
    pub fn with_assessor(mut self, assessor: Assessor) -> Self {
        self.assessor = Arc::new(assessor);
        self
    }

    /// Set the alert log.
    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<AlertLog>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Set the fallback generator. `None` disables simulation.
    #[must_use]
    pub fn with_generator(mut self, generator: Option<SimulationGenerator>) -> Self {
        self.generator = generator;
        self
    }

    /// Set the helmets expected even before they report.
    ///
    /// Roster helmets are reserved in the store so the helmet limit never
    /// drops them from a snapshot.
    #[must_use]
    pub fn with_roster<I>(mut self, roster: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<RosterEntry>,
    {
        self.roster = roster
            .into_iter()
            .map(Into::into)
            .map(|entry: RosterEntry| (entry.id.clone(), entry))
            .collect();
        self.store.reserve(self.roster.keys());
        self
    }

    /// Set the tick interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the staleness window.
    #[must_use]
    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Number of ticks run so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Run one aggregation tick at `now` and publish the result.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Arc<Snapshot> {
        self.tick += 1;
        let tick = self.tick;

        let mut ids: BTreeSet<String> = self.roster.keys().cloned().collect();
        ids.extend(self.store.known_helmet_ids());

        let readings: BTreeMap<String, Reading> = ids
            .into_iter()
            .filter_map(|helmet_id| {
                let reading = self.resolve(&helmet_id, tick, now)?;
                Some((helmet_id, reading))
            })
            .collect();
        let mut assessments = self.assess_all(&readings).await;

        let mut helmets = BTreeMap::new();
        for (helmet_id, reading) in readings {
            let assessment = assessments.remove(&helmet_id).unwrap_or_else(|| {
                self.assessor.thresholds().assess_values(&reading.values)
            });
            self.store.set_risk(&helmet_id, assessment.level);

            let alert = self
                .alerts
                .observe(tick, now, &helmet_id, &assessment, reading.source);
            if let Some(alert) = alert {
                match alert.kind {
                    AlertKind::Raised | AlertKind::Escalated => warn!(
                        helmet_id = %alert.helmet_id,
                        from = %alert.from,
                        to = %alert.to,
                        source = %alert.source,
                        breached = ?alert.breached,
                        "risk level raised"
                    ),
                    AlertKind::Downgraded | AlertKind::Cleared => info!(
                        helmet_id = %alert.helmet_id,
                        from = %alert.from,
                        to = %alert.to,
                        "risk level lowered"
                    ),
                }
            }

            let last_live_at = self
                .store
                .summary(&helmet_id)
                .and_then(|summary| summary.last_live_at);
            let mut status = HelmetStatus::new(reading, assessment, last_live_at);
            if let Some(entry) = self.roster.get(&helmet_id) {
                status = status.with_roster_entry(entry);
            }
            helmets.insert(helmet_id, status);
        }

        let snapshot = self.publisher.publish(Snapshot::new(tick, now, helmets));
        debug!(
            tick,
            helmets = snapshot.summary.total,
            live = snapshot.summary.live,
            simulated = snapshot.summary.simulated,
            "published snapshot"
        );
        snapshot
    }

    /// Assess every reading at once, so a slow model delegate costs one
    /// timeout per tick rather than one per helmet.
    ///
    /// A helmet whose assessment task fails is missing from the result.
    async fn assess_all(&self, readings: &BTreeMap<String, Reading>) -> BTreeMap<String, Assessment> {
        let mut tasks = JoinSet::new();
        for (helmet_id, reading) in readings {
            let assessor = Arc::clone(&self.assessor);
            let helmet_id = helmet_id.clone();
            let reading = reading.clone();
            tasks.spawn(async move {
                let assessment = assessor.assess(&reading).await;
                (helmet_id, assessment)
            });
        }

        let mut assessments = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((helmet_id, assessment)) => {
                    assessments.insert(helmet_id, assessment);
                }
                Err(e) => warn!(error = %e, "assessment task failed, using thresholds only"),
            }
        }
        assessments
    }

    /// The reading to use for a helmet this tick, if any.
    ///
    /// Without a generator a stale helmet is left out rather than shown with
    /// an outdated live reading.
    fn resolve(&self, helmet_id: &str, tick: u64, now: DateTime<Utc>) -> Option<Reading> {
        let Some(generator) = &self.generator else {
            return self
                .store
                .is_fresh(helmet_id, now, self.staleness)
                .then(|| self.store.latest(helmet_id))
                .flatten()
                .filter(Reading::is_live);
        };

        match self
            .store
            .latest_or_fallback(helmet_id, now, self.staleness, || {
                generator.generate(helmet_id, tick, now)
            }) {
            Ok(reading) => {
                if !reading.is_live() {
                    debug!(helmet_id, tick, "no fresh live reading, using simulation");
                }
                Some(reading)
            }
            Err(e) => {
                warn!(helmet_id, error = %e, "cannot track helmet");
                None
            }
        }
    }

    /// Tick on the configured interval until shutdown.
    ///
    /// A tick that has started always runs to completion and publishes.
    pub async fn run(mut self, shutdown: ShutdownHandle) {
        info!(
            interval_ms = self.interval.as_millis(),
            staleness_ms = self.staleness.as_millis(),
            roster = self.roster.len(),
            simulation = self.generator.is_some(),
            "starting aggregator"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.stopped() => break,
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        info!(ticks = self.tick, "aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{DelegateError, ModelDelegate};
    use async_trait::async_trait;
    use crate::reading::{sample_values, Source};
    use crate::risk::RiskLevel;
    use crate::snapshot;

    fn live(helmet: &str, co2: f64, at: DateTime<Utc>) -> Reading {
        let mut values = sample_values();
        values.co2 = co2;
        Reading::live(helmet, values, at)
    }

    fn aggregator(store: &Arc<HelmetStore>) -> (Aggregator, snapshot::SnapshotReader) {
        let (publisher, reader) = snapshot::channel();
        let aggregator = Aggregator::new(Arc::clone(store), publisher)
            .with_generator(Some(SimulationGenerator::new(11)))
            .with_staleness(Duration::from_secs(5));
        (aggregator, reader)
    }

    #[tokio::test]
    async fn test_fresh_live_reading_is_used() {
        let store = Arc::new(HelmetStore::default());
        let now = Utc::now();
        store
            .append_at("HELMET_001", live("HELMET_001", 900.0, now), now)
            .unwrap();

        let (mut aggregator, reader) = aggregator(&store);
        let snapshot = aggregator.tick(now).await;

        let entry = snapshot.get("HELMET_001").unwrap();
        assert_eq!(entry.risk, RiskLevel::Danger);
        assert_eq!(entry.source, Source::Live);
        assert_eq!(entry.reading.values.co2, 900.0);
        assert_eq!(reader.current().tick, 1);
        // Nothing was simulated, so history holds just the live reading.
        assert_eq!(store.history("HELMET_001").unwrap().len(), 1);
        assert_eq!(store.summary("HELMET_001").unwrap().risk, Some(RiskLevel::Danger));
    }

    #[tokio::test]
    async fn test_stale_helmet_is_simulated() {
        let store = Arc::new(HelmetStore::default());
        let now = Utc::now();
        let then = now - chrono::Duration::seconds(10);
        store
            .append_at("HELMET_002", live("HELMET_002", 420.0, then), then)
            .unwrap();

        let (mut aggregator, _reader) = aggregator(&store);
        let snapshot = aggregator.tick(now).await;

        let entry = snapshot.get("HELMET_002").unwrap();
        assert_eq!(entry.source, Source::Simulated);
        assert_eq!(entry.last_live_at, Some(then));
        // The simulated reading rolls the helmet's history forward.
        let history = store.history("HELMET_002").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].source, Source::Simulated);
    }

    #[tokio::test]
    async fn test_roster_helmets_without_data_are_simulated() {
        let store = Arc::new(HelmetStore::default());
        let (aggregator, _reader) = aggregator(&store);
        let mut aggregator =
            aggregator.with_roster(vec!["HELMET_001".to_string(), "HELMET_002".to_string()]);

        let snapshot = aggregator.tick(Utc::now()).await;
        assert_eq!(snapshot.summary.total, 2);
        assert_eq!(snapshot.summary.simulated, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_union_of_roster_and_feed() {
        let store = Arc::new(HelmetStore::default());
        let now = Utc::now();
        store
            .append_at("HELMET_042", live("HELMET_042", 420.0, now), now)
            .unwrap();

        let (aggregator, _reader) = aggregator(&store);
        let mut aggregator = aggregator.with_roster(vec!["HELMET_001".to_string()]);

        let snapshot = aggregator.tick(now).await;
        let ids: Vec<_> = snapshot.helmets.keys().cloned().collect();
        assert_eq!(ids, vec!["HELMET_001", "HELMET_042"]);
        assert_eq!(snapshot.summary.live, 1);
        assert_eq!(snapshot.summary.simulated, 1);
    }

    #[tokio::test]
    async fn test_never_live_once_stale() {
        let store = Arc::new(HelmetStore::default());
        let start = Utc::now();
        store
            .append_at("HELMET_001", live("HELMET_001", 420.0, start), start)
            .unwrap();

        let (mut aggregator, _reader) = aggregator(&store);
        for second in 0..12 {
            let now = start + chrono::Duration::seconds(second);
            let snapshot = aggregator.tick(now).await;
            let entry = snapshot.get("HELMET_001").unwrap();
            if second <= 5 {
                assert_eq!(entry.source, Source::Live, "second {second}");
            } else {
                assert_eq!(entry.source, Source::Simulated, "second {second}");
            }
        }
    }

    #[tokio::test]
    async fn test_simulation_disabled_omits_stale_helmets() {
        let store = Arc::new(HelmetStore::default());
        let now = Utc::now();
        let then = now - chrono::Duration::seconds(10);
        store
            .append_at("HELMET_001", live("HELMET_001", 420.0, now), now)
            .unwrap();
        store
            .append_at("HELMET_002", live("HELMET_002", 420.0, then), then)
            .unwrap();

        let (aggregator, _reader) = aggregator(&store);
        let mut aggregator = aggregator
            .with_generator(None)
            .with_roster(vec!["HELMET_003".to_string()]);

        let snapshot = aggregator.tick(now).await;
        assert!(snapshot.get("HELMET_001").is_some());
        assert!(snapshot.get("HELMET_002").is_none());
        assert!(snapshot.get("HELMET_003").is_none());
        assert_eq!(store.history("HELMET_002").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transitions_reach_alert_log() {
        let store = Arc::new(HelmetStore::default());
        let alerts = Arc::new(AlertLog::default());
        let start = Utc::now();

        let (aggregator, _reader) = aggregator(&store);
        let mut aggregator = aggregator.with_alerts(Arc::clone(&alerts));

        store
            .append_at("HELMET_001", live("HELMET_001", 900.0, start), start)
            .unwrap();
        aggregator.tick(start).await;

        let later = start + chrono::Duration::seconds(2);
        store
            .append_at("HELMET_001", live("HELMET_001", 420.0, later), later)
            .unwrap();
        aggregator.tick(later).await;

        let recent = alerts.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, AlertKind::Cleared);
        assert_eq!(recent[1].kind, AlertKind::Raised);
        assert_eq!(recent[1].to, RiskLevel::Danger);
    }

    #[tokio::test]
    async fn test_full_store_keeps_roster_helmets() {
        let store = Arc::new(HelmetStore::new(100, 2));
        let now = Utc::now();
        for rogue in ["ROGUE_1", "ROGUE_2"] {
            store.append_at(rogue, live(rogue, 420.0, now), now).unwrap();
        }

        let (aggregator, _reader) = aggregator(&store);
        let mut aggregator = aggregator.with_roster(vec!["HELMET_001".to_string()]);

        let snapshot = aggregator.tick(now).await;
        let ids: Vec<_> = snapshot.helmets.keys().cloned().collect();
        assert_eq!(ids, vec!["HELMET_001", "ROGUE_1", "ROGUE_2"]);
        assert_eq!(snapshot.get("HELMET_001").unwrap().source, Source::Simulated);

        // Ids beyond the limit are still turned away.
        assert!(store.append_at("ROGUE_3", live("ROGUE_3", 420.0, now), now).is_err());
        let snapshot = aggregator.tick(now).await;
        assert!(snapshot.get("ROGUE_3").is_none());
        assert_eq!(snapshot.summary.total, 3);
    }

    #[tokio::test]
    async fn test_roster_entry_annotates_status() {
        let store = Arc::new(HelmetStore::default());
        let (aggregator, _reader) = aggregator(&store);
        let mut aggregator = aggregator.with_roster(vec![
            RosterEntry::assigned("HELMET_001", "John Smith", "Tunnel A-1"),
            RosterEntry::from("HELMET_002"),
        ]);

        let snapshot = aggregator.tick(Utc::now()).await;
        let entry = snapshot.get("HELMET_001").unwrap();
        assert_eq!(entry.miner.as_deref(), Some("John Smith"));
        assert_eq!(entry.location.as_deref(), Some("Tunnel A-1"));
        assert!(snapshot.get("HELMET_002").unwrap().miner.is_none());
    }

    #[derive(Debug)]
    struct SlowDelegate(Duration);

    #[async_trait]
    impl ModelDelegate for SlowDelegate {
        fn name(&self) -> &str {
            "slow"
        }

        async fn predict(&self, _features: &[f64]) -> Result<String, DelegateError> {
            tokio::time::sleep(self.0).await;
            Ok("risk_0".to_string())
        }
    }

    #[tokio::test]
    async fn test_slow_model_costs_one_delay_per_tick() {
        let delay = Duration::from_millis(300);
        let store = Arc::new(HelmetStore::default());
        let roster: Vec<String> = (1..=8).map(|n| format!("HELMET_{n:03}")).collect();
        let (aggregator, _reader) = aggregator(&store);
        let mut aggregator = aggregator.with_roster(roster).with_assessor(
            Assessor::new(ThresholdTable::default()).with_delegate(Arc::new(SlowDelegate(delay))),
        );

        let started = std::time::Instant::now();
        let snapshot = aggregator.tick(Utc::now()).await;
        let elapsed = started.elapsed();

        // Serial calls would take 8 delays.
        assert!(elapsed < delay * 3, "tick took {elapsed:?}");
        assert_eq!(snapshot.summary.total, 8);
        assert!(snapshot
            .helmets
            .values()
            .all(|entry| entry.model_label.as_deref() == Some("risk_0")));
    }

    #[tokio::test]
    async fn test_run_ticks_until_shutdown() {
        let store = Arc::new(HelmetStore::default());
        let (aggregator, mut reader) = aggregator(&store);
        let aggregator = aggregator
            .with_roster(vec!["HELMET_001".to_string()])
            .with_interval(Duration::from_millis(10));
        let shutdown = ShutdownHandle::new();
        let task = tokio::spawn(aggregator.run(shutdown.clone()));

        let first = reader.next().await.unwrap();
        assert!(first.tick >= 1);
        assert!(first.get("HELMET_001").is_some());

        shutdown.stop();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("aggregator should stop")
            .unwrap();
    }
}
