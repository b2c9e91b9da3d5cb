//! Live feed listener.
//!
//! The receive loop drives a [`FeedTransport`] through the connection
//! lifecycle and pushes raw messages into a bounded queue. A single writer
//! task drains that queue, decodes each payload and appends it to the store,
//! so network timing never holds a store lock and one bad payload never
//! affects another helmet.
//!
//! ```text
//! DISCONNECTED ──▶ CONNECTING ──(suback or message)──▶ SUBSCRIBED ──(message)──▶ SUBSCRIBED
//!      ▲                │                                  │
//!      └──(error, backoff)─────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::Config;
use crate::error::Error;
use crate::shutdown::ShutdownHandle;
use crate::store::HelmetStore;

/// Errors raised by the broker transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established or was lost.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The subscription request could not be issued.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// A publish request could not be queued.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The transport has no more events to deliver.
    #[error("transport closed")]
    Closed,
}

/// Connection lifecycle of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Not connected; waiting to retry.
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and subscribed to the telemetry topic.
    Subscribed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Subscribed => write!(f, "subscribed"),
        }
    }
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The broker accepted the connection.
    Connected,
    /// The broker acknowledged the subscription.
    Subscribed,
    /// A message arrived.
    Message {
        /// Topic the message was published on.
        topic: String,
        /// Raw payload bytes.
        payload: Vec<u8>,
    },
    /// Protocol traffic with no pipeline meaning (pings, acks).
    Idle,
}

/// A source of broker events.
///
/// Implementors reconnect on the next call to [`FeedTransport::next_event`]
/// after an error.
#[async_trait]
pub trait FeedTransport: Send {
    /// Request a subscription to the telemetry topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be issued.
    async fn subscribe(&mut self) -> Result<(), TransportError>;

    /// Wait for the next event, connecting first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or drops.
    async fn next_event(&mut self) -> Result<FeedEvent, TransportError>;
}

/// MQTT transport backed by `rumqttc`.
pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl MqttTransport {
    /// Create a transport for the configured broker and topic.
    ///
    /// No connection is made until the first event is polled.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let mut options = MqttOptions::new(
            config.broker.client_id.clone(),
            config.broker.host.clone(),
            config.broker.port,
        );
        options.set_keep_alive(config.keep_alive());
        let (client, eventloop) = AsyncClient::new(options, 10);
        Self {
            client,
            eventloop,
            topic: config.broker.topic.clone(),
        }
    }
}

#[async_trait]
impl FeedTransport for MqttTransport {
    async fn subscribe(&mut self) -> Result<(), TransportError> {
        self.client
            .try_subscribe(self.topic.clone(), QoS::AtMostOnce)
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn next_event(&mut self) -> Result<FeedEvent, TransportError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => Ok(FeedEvent::Connected),
            Ok(Event::Incoming(Packet::SubAck(_))) => Ok(FeedEvent::Subscribed),
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(FeedEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(_) => Ok(FeedEvent::Idle),
            Err(e) => Err(TransportError::Connection(e.to_string())),
        }
    }
}

/// A message handed from the receive loop to the store writer.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
}

/// Counters and state shared between the feed tasks and status consumers.
#[derive(Debug, Default)]
pub struct FeedStats {
    state: Mutex<ConnectionState>,
    connect_attempts: AtomicU64,
    failed_attempts: AtomicU64,
    received: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// A point-in-time copy of [`FeedStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedStatsSnapshot {
    /// Current connection state.
    pub state: ConnectionState,
    /// Connection attempts since startup.
    pub connect_attempts: u64,
    /// Failed or dropped connections since startup.
    pub failed_attempts: u64,
    /// Messages received from the broker or posted over HTTP.
    pub received: u64,
    /// Messages decoded and stored.
    pub accepted: u64,
    /// Messages dropped as malformed or over the helmet limit.
    pub rejected: u64,
}

impl FeedStats {
    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counters.
    #[must_use]
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            state: self.state(),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// The receive loop.
#[derive(Debug)]
pub struct LiveFeedListener<T> {
    transport: T,
    tx: mpsc::Sender<RawMessage>,
    backoff: Duration,
    stats: Arc<FeedStats>,
    state: ConnectionState,
}

impl<T: FeedTransport> LiveFeedListener<T> {
    /// Create a listener forwarding messages into `tx`.
    #[must_use]
    pub fn new(
        transport: T,
        tx: mpsc::Sender<RawMessage>,
        backoff: Duration,
        stats: Arc<FeedStats>,
    ) -> Self {
        Self {
            transport,
            tx,
            backoff,
            stats,
            state: ConnectionState::Disconnected,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "feed state change");
            self.state = next;
            self.stats.set_state(next);
        }
    }

    /// Run until shutdown is signalled or the queue's reader goes away.
    ///
    /// Transport errors are never fatal: the listener waits for the fixed
    /// backoff and tries again, indefinitely.
    pub async fn run(mut self, shutdown: ShutdownHandle) {
        info!(backoff_ms = self.backoff.as_millis(), "starting live feed listener");
        let mut attempt: u64 = 0;

        while !shutdown.should_stop() {
            if self.state == ConnectionState::Disconnected {
                attempt += 1;
                self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
                self.transition(ConnectionState::Connecting);
            }

            let event = tokio::select! {
                () = shutdown.stopped() => break,
                event = self.transport.next_event() => event,
            };

            let result = match event {
                Ok(FeedEvent::Connected) => {
                    info!(attempt, "connected to broker");
                    attempt = 0;
                    self.transport.subscribe().await
                }
                Ok(FeedEvent::Subscribed) => {
                    info!("subscribed to telemetry topic");
                    self.transition(ConnectionState::Subscribed);
                    Ok(())
                }
                Ok(FeedEvent::Message { topic, payload }) => {
                    // Delivery proves the subscription even if its ack was missed.
                    self.transition(ConnectionState::Subscribed);
                    self.stats.record_received();
                    let message = RawMessage {
                        topic,
                        payload,
                        received_at: Utc::now(),
                    };
                    let sent = tokio::select! {
                        () = shutdown.stopped() => break,
                        sent = self.tx.send(message) => sent,
                    };
                    if sent.is_err() {
                        debug!("ingest queue closed, stopping listener");
                        break;
                    }
                    Ok(())
                }
                Ok(FeedEvent::Idle) => Ok(()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                self.transition(ConnectionState::Disconnected);
                warn!(
                    attempt,
                    error = %e,
                    retry_in_ms = self.backoff.as_millis(),
                    "broker connection failed"
                );
                tokio::select! {
                    () = shutdown.stopped() => break,
                    () = tokio::time::sleep(self.backoff) => {}
                }
            }
        }

        self.transition(ConnectionState::Disconnected);
        info!("live feed listener stopped");
    }
}

/// Decode one message and append it to the store.
///
/// # Errors
///
/// Returns a decode or store error; the store is untouched in either case.
pub fn ingest(store: &HelmetStore, message: &RawMessage) -> Result<(), Error> {
    let reading = codec::decode(&message.topic, &message.payload, message.received_at)?;
    let helmet_id = reading.helmet_id.clone();
    store.append_at(&helmet_id, reading, message.received_at)?;
    Ok(())
}

/// The single store writer: drains the queue until shutdown or until the
/// listener goes away.
pub async fn run_ingest(
    mut rx: mpsc::Receiver<RawMessage>,
    store: Arc<HelmetStore>,
    stats: Arc<FeedStats>,
    shutdown: ShutdownHandle,
) {
    debug!("starting ingest writer");
    loop {
        let message = tokio::select! {
            () = shutdown.stopped() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        match ingest(&store, &message) {
            Ok(()) => {
                stats.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %message.topic, error = %e, "dropping telemetry message");
            }
        }
    }
    debug!("ingest writer stopped");
}
