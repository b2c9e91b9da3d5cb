//! Pipeline wiring.
//!
//! Starts one task per long-lived activity: the feed listener, the single
//! store writer, the aggregator and (optionally) the snapshot server. All of
//! them share one [`ShutdownHandle`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::alerts::AlertLog;
use crate::config::Config;
use crate::delegate::{Assessor, CommandDelegate};
use crate::error::Result;
use crate::listener::{self, FeedStats, FeedTransport, LiveFeedListener, MqttTransport};
use crate::server::{self, AppState};
use crate::shutdown::ShutdownHandle;
use crate::snapshot::{self, SnapshotReader};
use crate::store::HelmetStore;

/// Entry point for starting the pipeline.
#[derive(Debug)]
pub struct Pipeline;

impl Pipeline {
    /// Start the pipeline against the configured MQTT broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the snapshot
    /// server cannot bind.
    pub async fn start(config: &Config) -> Result<PipelineHandle> {
        Self::start_with_transport(config, MqttTransport::new(config)).await
    }

    /// Start the pipeline with a caller-supplied transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the snapshot
    /// server cannot bind.
    pub async fn start_with_transport<T>(config: &Config, transport: T) -> Result<PipelineHandle>
    where
        T: FeedTransport + 'static,
    {
        config.validate()?;

        // Bind before spawning anything so a taken port fails startup cleanly.
        let server_listener = if config.server.enabled {
            Some(server::bind(config.bind_addr()?).await?)
        } else {
            None
        };

        let shutdown = ShutdownHandle::new();
        let store = Arc::new(HelmetStore::new(
            config.pipeline.history_capacity,
            config.pipeline.max_helmets,
        ));
        let stats = Arc::new(FeedStats::default());
        let alerts = Arc::new(AlertLog::new(config.alerts.capacity));
        let (publisher, reader) = snapshot::channel();

        let mut assessor = Assessor::new(config.thresholds.clone());
        if config.delegate.enabled {
            info!(command = %config.delegate.command, "model delegate enabled");
            assessor = assessor.with_delegate(Arc::new(CommandDelegate::from_config(&config.delegate)));
        }

        // Built first so the roster is reserved before any feed traffic.
        let aggregator = Aggregator::from_config(
            config,
            Arc::clone(&store),
            publisher,
            assessor,
            Arc::clone(&alerts),
        );

        let mut tasks = Vec::new();

        let (tx, rx) = mpsc::channel(config.broker.channel_capacity);
        let http_tx = tx.clone();
        let feed = LiveFeedListener::new(transport, tx, config.reconnect_backoff(), Arc::clone(&stats));
        tasks.push(tokio::spawn(feed.run(shutdown.clone())));
        tasks.push(tokio::spawn(listener::run_ingest(
            rx,
            Arc::clone(&store),
            Arc::clone(&stats),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(aggregator.run(shutdown.clone())));

        let mut local_addr = None;
        if let Some(server_listener) = server_listener {
            local_addr = Some(server_listener.local_addr()?);
            let state = AppState::new(
                reader.clone(),
                Arc::clone(&store),
                Arc::clone(&alerts),
                Arc::clone(&stats),
            )
            .with_ingest(http_tx);
            let server_shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server::serve(server_listener, state, server_shutdown).await {
                    error!(error = %e, "snapshot server failed");
                }
            }));
        }

        info!(
            broker = %format!("{}:{}", config.broker.host, config.broker.port),
            topic = %config.broker.topic,
            roster = config.pipeline.roster.len(),
            "pipeline started"
        );

        Ok(PipelineHandle {
            shutdown,
            tasks,
            reader,
            store,
            alerts,
            stats,
            local_addr,
        })
    }
}

/// Handle to a running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    shutdown: ShutdownHandle,
    tasks: Vec<JoinHandle<()>>,
    reader: SnapshotReader,
    store: Arc<HelmetStore>,
    alerts: Arc<AlertLog>,
    stats: Arc<FeedStats>,
    local_addr: Option<SocketAddr>,
}

impl PipelineHandle {
    /// A reader of published snapshots.
    #[must_use]
    pub fn reader(&self) -> SnapshotReader {
        self.reader.clone()
    }

    /// The helmet store.
    #[must_use]
    pub fn store(&self) -> Arc<HelmetStore> {
        Arc::clone(&self.store)
    }

    /// The alert log.
    #[must_use]
    pub fn alerts(&self) -> Arc<AlertLog> {
        Arc::clone(&self.alerts)
    }

    /// Feed counters and connection state.
    #[must_use]
    pub fn stats(&self) -> Arc<FeedStats> {
        Arc::clone(&self.stats)
    }

    /// Address the snapshot server is bound to, if enabled.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Signal every task to stop and wait for them to finish.
    pub async fn shutdown(self) {
        info!("stopping pipeline");
        self.shutdown.stop();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "pipeline task ended abnormally");
            }
        }
        info!("pipeline stopped");
    }
}
