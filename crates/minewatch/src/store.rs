//! Helmet state store.
//!
//! The store is the single shared mutable resource of the pipeline. It owns
//! one [`HelmetRecord`] per helmet, each behind its own mutex, so appends to
//! one helmet never block reads of another. The outer map lock is only held
//! to look up or create a record.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::reading::Reading;
use crate::risk::RiskLevel;

/// Default number of readings kept per helmet.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Errors raised by the store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store already tracks the maximum number of helmets.
    #[error("helmet limit of {limit} reached")]
    HelmetLimit {
        /// Configured maximum.
        limit: usize,
    },
}

/// Fixed-capacity FIFO history; the oldest reading is evicted on overflow.
#[derive(Debug, Clone)]
pub struct History {
    readings: VecDeque<Reading>,
    capacity: usize,
}

impl History {
    /// Create an empty history holding at most `capacity` readings.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a reading, returning the evicted one if the buffer was full.
    pub fn push(&mut self, reading: Reading) -> Option<Reading> {
        let evicted = if self.readings.len() == self.capacity {
            self.readings.pop_front()
        } else {
            None
        };
        self.readings.push_back(reading);
        evicted
    }

    /// The most recent reading.
    #[must_use]
    pub fn latest(&self) -> Option<&Reading> {
        self.readings.back()
    }

    /// Number of readings held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Check if the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter()
    }
}

/// Everything the store knows about one helmet.
#[derive(Debug, Clone)]
pub struct HelmetRecord {
    helmet_id: String,
    history: History,
    last_live_at: Option<DateTime<Utc>>,
    risk: Option<RiskLevel>,
}

impl HelmetRecord {
    fn new(helmet_id: String, capacity: usize) -> Self {
        Self {
            helmet_id,
            history: History::with_capacity(capacity),
            last_live_at: None,
            risk: None,
        }
    }

    fn append(&mut self, reading: Reading, at: DateTime<Utc>) {
        if reading.is_live() {
            self.last_live_at = Some(self.last_live_at.map_or(at, |prev| prev.max(at)));
        }
        if self.history.push(reading).is_some() {
            debug!(helmet_id = %self.helmet_id, "history full, evicted oldest reading");
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        let Some(last) = self.last_live_at else {
            return false;
        };
        let window = chrono::Duration::from_std(staleness).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(last) <= window
    }

    fn summary(&self) -> HelmetSummary {
        HelmetSummary {
            helmet_id: self.helmet_id.clone(),
            readings: self.history.len(),
            last_live_at: self.last_live_at,
            risk: self.risk,
        }
    }
}

/// A read-only copy of a helmet's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HelmetSummary {
    /// The helmet.
    pub helmet_id: String,
    /// Number of readings in history.
    pub readings: usize,
    /// When the last live reading was appended.
    pub last_live_at: Option<DateTime<Utc>>,
    /// Last classified risk level.
    pub risk: Option<RiskLevel>,
}

/// Concurrent per-helmet history and freshness store.
#[derive(Debug)]
pub struct HelmetStore {
    records: RwLock<HashMap<String, Arc<Mutex<HelmetRecord>>>>,
    capacity: usize,
    max_helmets: usize,
}

impl Default for HelmetStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, usize::MAX)
    }
}

impl HelmetStore {
    /// Create a store keeping `capacity` readings per helmet for at most
    /// `max_helmets` helmets.
    #[must_use]
    pub fn new(capacity: usize, max_helmets: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            max_helmets,
        }
    }

    fn get(&self, helmet_id: &str) -> Option<Arc<Mutex<HelmetRecord>>> {
        self.records.read().get(helmet_id).cloned()
    }

    /// Track the given helmets ahead of any traffic.
    ///
    /// Reserved helmets are created even past `max_helmets`, so unknown ids
    /// arriving on the feed can never crowd a rostered helmet out.
    pub fn reserve<I, S>(&self, helmet_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut records = self.records.write();
        for helmet_id in helmet_ids {
            let helmet_id = helmet_id.as_ref();
            records.entry(helmet_id.to_string()).or_insert_with(|| {
                debug!(helmet_id, "reserved helmet");
                Arc::new(Mutex::new(HelmetRecord::new(
                    helmet_id.to_string(),
                    self.capacity,
                )))
            });
        }
    }

    fn get_or_create(&self, helmet_id: &str) -> Result<Arc<Mutex<HelmetRecord>>, StoreError> {
        if let Some(record) = self.get(helmet_id) {
            return Ok(record);
        }

        let mut records = self.records.write();
        // Another writer may have created it between the two locks.
        if let Some(record) = records.get(helmet_id) {
            return Ok(Arc::clone(record));
        }
        if records.len() >= self.max_helmets {
            return Err(StoreError::HelmetLimit {
                limit: self.max_helmets,
            });
        }
        debug!(helmet_id, "tracking new helmet");
        let record = Arc::new(Mutex::new(HelmetRecord::new(
            helmet_id.to_string(),
            self.capacity,
        )));
        records.insert(helmet_id.to_string(), Arc::clone(&record));
        Ok(record)
    }

    /// Append a reading stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::HelmetLimit`] if the helmet is new and the store is full.
    pub fn append(&self, helmet_id: &str, reading: Reading) -> Result<(), StoreError> {
        self.append_at(helmet_id, reading, Utc::now())
    }

    /// Append a reading received at `at`.
    ///
    /// Live readings refresh the helmet's freshness clock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::HelmetLimit`] if the helmet is new and the store is full.
    pub fn append_at(
        &self,
        helmet_id: &str,
        reading: Reading,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = self.get_or_create(helmet_id)?;
        record.lock().append(reading, at);
        Ok(())
    }

    /// The most recent reading for a helmet.
    #[must_use]
    pub fn latest(&self, helmet_id: &str) -> Option<Reading> {
        self.get(helmet_id)?.lock().history.latest().cloned()
    }

    /// Check whether a live reading arrived within `staleness` of `now`.
    #[must_use]
    pub fn is_fresh(&self, helmet_id: &str, now: DateTime<Utc>, staleness: Duration) -> bool {
        self.get(helmet_id)
            .is_some_and(|record| record.lock().is_fresh(now, staleness))
    }

    /// Return the latest live reading if fresh, otherwise append the reading
    /// produced by `fallback` and return that.
    ///
    /// The freshness check and the append happen under the helmet's lock, so a
    /// live reading arriving concurrently is never shadowed by a simulated one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::HelmetLimit`] if the helmet is new and the store is full.
    pub fn latest_or_fallback(
        &self,
        helmet_id: &str,
        now: DateTime<Utc>,
        staleness: Duration,
        fallback: impl FnOnce() -> Reading,
    ) -> Result<Reading, StoreError> {
        let record = self.get_or_create(helmet_id)?;
        let mut record = record.lock();
        if record.is_fresh(now, staleness) {
            if let Some(latest) = record.history.latest().filter(|r| r.is_live()) {
                return Ok(latest.clone());
            }
        }
        let reading = fallback();
        record.append(reading.clone(), now);
        Ok(reading)
    }

    /// Cache the latest classification for a helmet.
    pub fn set_risk(&self, helmet_id: &str, risk: RiskLevel) {
        if let Some(record) = self.get(helmet_id) {
            record.lock().risk = Some(risk);
        }
    }

    /// Every helmet id seen so far, live or simulated.
    #[must_use]
    pub fn known_helmet_ids(&self) -> BTreeSet<String> {
        self.records.read().keys().cloned().collect()
    }

    /// Copy of a helmet's history, oldest first.
    #[must_use]
    pub fn history(&self, helmet_id: &str) -> Option<Vec<Reading>> {
        let record = self.get(helmet_id)?;
        let record = record.lock();
        Some(record.history.iter().cloned().collect())
    }

    /// Bookkeeping summary for a helmet.
    #[must_use]
    pub fn summary(&self, helmet_id: &str) -> Option<HelmetSummary> {
        Some(self.get(helmet_id)?.lock().summary())
    }

    /// Number of helmets tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if no helmet has been seen yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{sample_values, Source};

    const STALENESS: Duration = Duration::from_secs(5);

    fn live(helmet: &str, co2: f64) -> Reading {
        let mut values = sample_values();
        values.co2 = co2;
        Reading::live(helmet, values, Utc::now())
    }

    fn simulated(helmet: &str) -> Reading {
        Reading::simulated(helmet, sample_values(), Utc::now())
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = History::with_capacity(2);
        assert!(history.push(live("H", 1.0)).is_none());
        assert!(history.push(live("H", 2.0)).is_none());
        let evicted = history.push(live("H", 3.0)).unwrap();
        assert!((evicted.values.co2 - 1.0).abs() < f64::EPSILON);
        assert_eq!(history.len(), 2);
        assert!((history.latest().unwrap().values.co2 - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_history_zero_capacity_clamped() {
        let mut history = History::with_capacity(0);
        assert!(history.is_empty());
        assert!(history.push(live("H", 1.0)).is_none());
        assert!(history.push(live("H", 2.0)).is_some());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_append_bounded_to_capacity() {
        let store = HelmetStore::default();
        for i in 0..150 {
            store.append("HELMET_001", live("HELMET_001", f64::from(i))).unwrap();
        }

        let history = store.history("HELMET_001").unwrap();
        assert_eq!(history.len(), 100);
        // Exactly the last 100 survive; the first 50 are gone.
        assert!((history[0].values.co2 - 50.0).abs() < f64::EPSILON);
        assert!((history[99].values.co2 - 149.0).abs() < f64::EPSILON);
        assert!(history.iter().all(|r| r.values.co2 >= 50.0));
    }

    #[test]
    fn test_latest_unknown_helmet() {
        let store = HelmetStore::default();
        assert!(store.latest("HELMET_404").is_none());
        assert!(store.history("HELMET_404").is_none());
        assert!(store.summary("HELMET_404").is_none());
    }

    #[test]
    fn test_latest_returns_most_recent() {
        let store = HelmetStore::default();
        store.append("H", live("H", 400.0)).unwrap();
        store.append("H", live("H", 410.0)).unwrap();
        assert!((store.latest("H").unwrap().values.co2 - 410.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_is_fresh_after_live_append() {
        let store = HelmetStore::default();
        let now = Utc::now();
        store.append_at("H", live("H", 400.0), now).unwrap();

        assert!(store.is_fresh("H", now, STALENESS));
        assert!(store.is_fresh("H", now + chrono::Duration::milliseconds(4_999), STALENESS));
        assert!(store.is_fresh("H", now + chrono::Duration::seconds(5), STALENESS));
        assert!(!store.is_fresh("H", now + chrono::Duration::milliseconds(5_001), STALENESS));
    }

    #[test]
    fn test_simulated_append_does_not_refresh() {
        let store = HelmetStore::default();
        let now = Utc::now();
        store.append_at("H", simulated("H"), now).unwrap();
        assert!(!store.is_fresh("H", now, STALENESS));
        assert_eq!(store.summary("H").unwrap().last_live_at, None);
    }

    #[test]
    fn test_is_fresh_unknown_helmet() {
        let store = HelmetStore::default();
        assert!(!store.is_fresh("nobody", Utc::now(), STALENESS));
    }

    #[test]
    fn test_known_helmet_ids_includes_simulated() {
        let store = HelmetStore::default();
        store.append("B", live("B", 400.0)).unwrap();
        store.append("A", simulated("A")).unwrap();
        let ids: Vec<_> = store.known_helmet_ids().into_iter().collect();
        assert_eq!(ids, ["A", "B"]);
    }

    #[test]
    fn test_helmet_limit() {
        let store = HelmetStore::new(10, 1);
        store.append("A", live("A", 400.0)).unwrap();
        let err = store.append("B", live("B", 400.0)).unwrap_err();
        assert_eq!(err, StoreError::HelmetLimit { limit: 1 });
        // Existing helmets keep working.
        assert!(store.append("A", live("A", 410.0)).is_ok());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reserved_helmets_survive_full_store() {
        let store = HelmetStore::new(10, 2);
        store.append("ROGUE_1", live("ROGUE_1", 400.0)).unwrap();
        store.append("ROGUE_2", live("ROGUE_2", 400.0)).unwrap();
        assert!(store.append("ROGUE_3", live("ROGUE_3", 400.0)).is_err());

        store.reserve(["HELMET_001"]);
        assert!(store.known_helmet_ids().contains("HELMET_001"));
        assert!(store.latest("HELMET_001").is_none());
        store
            .latest_or_fallback("HELMET_001", Utc::now(), STALENESS, || {
                simulated("HELMET_001")
            })
            .unwrap();

        // Still full for anything not reserved.
        assert!(store.append("ROGUE_3", live("ROGUE_3", 400.0)).is_err());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_reserve_is_idempotent() {
        let store = HelmetStore::new(10, 5);
        store.append("HELMET_001", live("HELMET_001", 400.0)).unwrap();
        store.reserve(["HELMET_001", "HELMET_002"]);
        store.reserve(vec!["HELMET_002".to_string()]);

        assert_eq!(store.len(), 2);
        // Reserving an existing helmet keeps its history.
        assert_eq!(store.history("HELMET_001").unwrap().len(), 1);
        assert!(store.history("HELMET_002").unwrap().is_empty());
    }

    #[test]
    fn test_latest_or_fallback_prefers_fresh_live() {
        let store = HelmetStore::default();
        let now = Utc::now();
        store.append_at("H", live("H", 900.0), now).unwrap();

        let reading = store
            .latest_or_fallback("H", now, STALENESS, || simulated("H"))
            .unwrap();
        assert_eq!(reading.source, Source::Live);
        assert_eq!(store.history("H").unwrap().len(), 1);
    }

    #[test]
    fn test_latest_or_fallback_appends_when_stale() {
        let store = HelmetStore::default();
        let then = Utc::now() - chrono::Duration::seconds(10);
        store.append_at("H", live("H", 900.0), then).unwrap();

        let reading = store
            .latest_or_fallback("H", Utc::now(), STALENESS, || simulated("H"))
            .unwrap();
        assert_eq!(reading.source, Source::Simulated);
        assert_eq!(store.latest("H").unwrap().source, Source::Simulated);
        assert_eq!(store.history("H").unwrap().len(), 2);
    }

    #[test]
    fn test_latest_or_fallback_creates_unknown_helmet() {
        let store = HelmetStore::default();
        let reading = store
            .latest_or_fallback("NEW", Utc::now(), STALENESS, || simulated("NEW"))
            .unwrap();
        assert_eq!(reading.source, Source::Simulated);
        assert!(store.known_helmet_ids().contains("NEW"));
    }

    #[test]
    fn test_set_risk() {
        let store = HelmetStore::default();
        store.append("H", live("H", 900.0)).unwrap();
        store.set_risk("H", RiskLevel::Danger);
        assert_eq!(store.summary("H").unwrap().risk, Some(RiskLevel::Danger));

        // Unknown helmets are ignored rather than created.
        store.set_risk("ghost", RiskLevel::Warning);
        assert!(store.summary("ghost").is_none());
    }

    #[test]
    fn test_concurrent_first_writes_create_one_record() {
        let store = Arc::new(HelmetStore::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        store.append("SHARED", live("SHARED", f64::from(i))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 1);
        assert_eq!(store.history("SHARED").unwrap().len(), 80);
    }
}
