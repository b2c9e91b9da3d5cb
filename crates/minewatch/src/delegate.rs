//! Optional external model delegation.
//!
//! A trained model may be consulted for a richer label, but the threshold
//! table stays authoritative: the model's label only annotates an
//! [`Assessment`], and any failure leaves the threshold result untouched.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::DelegateConfig;
use crate::reading::Reading;
use crate::risk::{Assessment, ThresholdTable};

/// Errors raised by an external classifier.
#[derive(Debug, Error)]
pub enum DelegateError {
    /// The model process could not be started or talked to.
    #[error("failed to invoke model: {0}")]
    Invoke(#[from] std::io::Error),

    /// The model did not answer in time.
    #[error("model timed out after {timeout_ms}ms")]
    Timeout {
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The model exited unsuccessfully.
    #[error("model exited with status {status}: {stderr}")]
    Failed {
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The model produced no usable label.
    #[error("model returned an empty label")]
    EmptyLabel,
}

/// An external classifier taking the ordered feature vector of a reading.
#[async_trait]
pub trait ModelDelegate: Send + Sync + std::fmt::Debug {
    /// Name of this delegate (for logging).
    fn name(&self) -> &str;

    /// Predict a label for the given features.
    ///
    /// # Errors
    ///
    /// Returns a [`DelegateError`] if the model cannot produce a label.
    async fn predict(&self, features: &[f64]) -> Result<String, DelegateError>;
}

/// Runs an external command per prediction.
///
/// The feature vector is written to stdin as a JSON array and the first
/// non-empty line of stdout is taken as the label.
#[derive(Debug, Clone)]
pub struct CommandDelegate {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDelegate {
    /// Create a delegate running `command` with `args`.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &DelegateConfig) -> Self {
        Self::new(
            config.command.clone(),
            config.args.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }

    async fn run(&self, features: &[f64]) -> Result<String, DelegateError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let input = serde_json::to_vec(features).map_err(std::io::Error::from)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            stdin.write_all(b"\n").await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(DelegateError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or(DelegateError::EmptyLabel)
    }
}

#[async_trait]
impl ModelDelegate for CommandDelegate {
    fn name(&self) -> &str {
        &self.command
    }

    async fn predict(&self, features: &[f64]) -> Result<String, DelegateError> {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        tokio::time::timeout(self.timeout, self.run(features))
            .await
            .map_err(|_| DelegateError::Timeout { timeout_ms })?
    }
}

/// Combines the threshold table with an optional advisory model.
#[derive(Debug, Clone)]
pub struct Assessor {
    thresholds: ThresholdTable,
    delegate: Option<Arc<dyn ModelDelegate>>,
}

impl Assessor {
    /// Create an assessor using only the threshold table.
    #[must_use]
    pub fn new(thresholds: ThresholdTable) -> Self {
        Self {
            thresholds,
            delegate: None,
        }
    }

    /// Attach an advisory model.
    #[must_use]
    pub fn with_delegate(mut self, delegate: Arc<dyn ModelDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// The authoritative threshold table.
    #[must_use]
    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    /// Assess a reading. Never fails: model errors fall back to thresholds alone.
    pub async fn assess(&self, reading: &Reading) -> Assessment {
        let mut assessment = self.thresholds.assess_values(&reading.values);
        let Some(delegate) = &self.delegate else {
            return assessment;
        };
        match delegate.predict(&reading.values.to_features()).await {
            Ok(label) => {
                debug!(helmet_id = %reading.helmet_id, %label, "model label");
                assessment.model_label = Some(label);
            }
            Err(e) => {
                warn!(
                    helmet_id = %reading.helmet_id,
                    delegate = delegate.name(),
                    error = %e,
                    "model delegate failed, using thresholds only"
                );
            }
        }
        assessment
    }

    /// Assess a reading, surfacing model failures instead of falling back.
    ///
    /// The level still comes from the threshold table.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ClassifierDelegate`] if a model is attached and fails.
    pub async fn assess_strict(&self, reading: &Reading) -> crate::Result<Assessment> {
        let mut assessment = self.thresholds.assess_values(&reading.values);
        if let Some(delegate) = &self.delegate {
            let label = delegate.predict(&reading.values.to_features()).await?;
            assessment.model_label = Some(label);
        }
        Ok(assessment)
    }
}
