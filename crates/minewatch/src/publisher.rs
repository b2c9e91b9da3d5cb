//! Synthetic test publisher.
//!
//! Publishes generated readings for a set of helmets to the configured
//! broker topic in the same wire shape real helmets use. Useful for driving
//! a pipeline end to end without hardware.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, QoS};
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::Config;
use crate::error::Result;
use crate::listener::TransportError;
use crate::reading::Reading;
use crate::shutdown::ShutdownHandle;
use crate::simulate::SimulationGenerator;

/// What to publish and how often.
#[derive(Debug, Clone)]
pub struct PublishPlan {
    /// Helmets to publish for, in order.
    pub helmets: Vec<String>,
    /// Delay between rounds.
    pub interval: Duration,
    /// Rounds to publish; `None` publishes until shutdown.
    pub rounds: Option<u64>,
    /// Seed for generated values.
    pub seed: Option<u64>,
}

/// One round of readings, stamped `now` and tagged live.
#[must_use]
pub fn round_readings(
    generator: &SimulationGenerator,
    helmets: &[String],
    round: u64,
    now: DateTime<Utc>,
) -> Vec<Reading> {
    helmets
        .iter()
        .map(|helmet_id| {
            let generated = generator.generate(helmet_id, round, now);
            Reading::live(generated.helmet_id, generated.values, now)
        })
        .collect()
}

/// Publish according to `plan` until its rounds are done or shutdown.
///
/// Returns the number of messages handed to the client.
///
/// # Errors
///
/// Returns a transport error if the client rejects a publish request.
pub async fn publish(config: &Config, plan: &PublishPlan, shutdown: ShutdownHandle) -> Result<u64> {
    let client_id = format!("{}-publisher-{}", config.broker.client_id, std::process::id());
    let mut options = MqttOptions::new(client_id, config.broker.host.clone(), config.broker.port);
    options.set_keep_alive(config.keep_alive());
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    let driver_shutdown = shutdown.clone();
    let backoff = config.reconnect_backoff();
    let driver = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = driver_shutdown.stopped() => break,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(event) => debug!(?event, "publisher event"),
                Err(e) => {
                    warn!(error = %e, retry_in_ms = backoff.as_millis(), "publisher connection failed");
                    tokio::select! {
                        () = driver_shutdown.stopped() => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    });

    let generator = plan
        .seed
        .map_or_else(SimulationGenerator::from_entropy, SimulationGenerator::new);
    info!(
        host = %config.broker.host,
        topic = %config.broker.topic,
        helmets = plan.helmets.len(),
        "publishing synthetic readings"
    );

    let mut sent = 0;
    let mut round = 0;
    while plan.rounds.map_or(true, |rounds| round < rounds) && !shutdown.should_stop() {
        for reading in round_readings(&generator, &plan.helmets, round, Utc::now()) {
            client
                .publish(
                    config.broker.topic.clone(),
                    QoS::AtLeastOnce,
                    false,
                    codec::encode(&reading),
                )
                .await
                .map_err(|e| TransportError::Publish(e.to_string()))?;
            sent += 1;
            info!(helmet_id = %reading.helmet_id, co2 = reading.values.co2, "published");
        }
        round += 1;

        if plan.rounds.map_or(true, |rounds| round < rounds) {
            tokio::select! {
                () = shutdown.stopped() => break,
                () = tokio::time::sleep(plan.interval) => {}
            }
        }
    }

    // Queued after the publishes, so they are flushed first.
    if let Err(e) = client.disconnect().await {
        debug!(error = %e, "disconnect request failed");
    }
    if tokio::time::timeout(Duration::from_secs(5), driver).await.is_err() {
        warn!("publisher did not disconnect cleanly");
    }
    info!(sent, "publisher finished");
    Ok(sent)
}
