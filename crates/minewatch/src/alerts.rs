//! Risk transition log.
//!
//! The aggregator reports every helmet's level once per tick; only changes
//! are recorded. The log is bounded and drops its oldest entries first.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::reading::{Dimension, Source};
use crate::risk::{Assessment, RiskLevel};

/// Default number of alerts retained.
pub const DEFAULT_ALERT_CAPACITY: usize = 1000;

/// How a helmet's level changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// SAFE to WARNING or DANGER.
    Raised,
    /// WARNING to DANGER.
    Escalated,
    /// DANGER to WARNING.
    Downgraded,
    /// Back to SAFE.
    Cleared,
}

impl AlertKind {
    fn between(from: RiskLevel, to: RiskLevel) -> Option<Self> {
        match (from, to) {
            _ if from == to => None,
            (RiskLevel::Safe, _) => Some(Self::Raised),
            (_, RiskLevel::Safe) => Some(Self::Cleared),
            (RiskLevel::Warning, RiskLevel::Danger) => Some(Self::Escalated),
            _ => Some(Self::Downgraded),
        }
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// Tick the transition was observed on.
    pub tick: u64,
    /// When it was observed.
    pub at: DateTime<Utc>,
    /// The helmet.
    pub helmet_id: String,
    /// Kind of change.
    pub kind: AlertKind,
    /// Previous level.
    pub from: RiskLevel,
    /// New level.
    pub to: RiskLevel,
    /// Dimensions at WARNING or above.
    pub breached: Vec<Dimension>,
    /// Provenance of the reading that caused it.
    pub source: Source,
}

#[derive(Debug)]
struct Inner {
    entries: VecDeque<Alert>,
    levels: HashMap<String, RiskLevel>,
}

/// Bounded, shared alert log.
#[derive(Debug)]
pub struct AlertLog {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_CAPACITY)
    }
}

impl AlertLog {
    /// Create a log retaining at most `capacity` alerts.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(64)),
                levels: HashMap::new(),
            }),
            capacity,
        }
    }

    /// Record a helmet's latest assessment, returning the alert if its level
    /// changed. Helmets start out SAFE.
    pub fn observe(
        &self,
        tick: u64,
        at: DateTime<Utc>,
        helmet_id: &str,
        assessment: &Assessment,
        source: Source,
    ) -> Option<Alert> {
        let mut inner = self.inner.lock();
        let from = inner
            .levels
            .insert(helmet_id.to_string(), assessment.level)
            .unwrap_or_default();
        let kind = AlertKind::between(from, assessment.level)?;

        let alert = Alert {
            tick,
            at,
            helmet_id: helmet_id.to_string(),
            kind,
            from,
            to: assessment.level,
            breached: assessment.breached(RiskLevel::Warning),
            source,
        };
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(alert.clone());
        Some(alert)
    }

    /// The most recent alerts, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.inner
            .lock()
            .entries
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of alerts retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if no alert has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}
