//! HTTP snapshot server.
//!
//! JSON endpoints over the latest published snapshot, the store's per-helmet
//! history and the alert log, plus a sensor-data endpoint for devices that
//! cannot reach the broker. Polling cadence is the client's business.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertLog};
use crate::codec::{self, DecodeError};
use crate::error::Result;
use crate::listener::{FeedStats, FeedStatsSnapshot, RawMessage};
use crate::reading::Reading;
use crate::shutdown::ShutdownHandle;
use crate::snapshot::{HelmetStatus, Snapshot, SnapshotReader};
use crate::store::HelmetStore;

const DEFAULT_ALERT_LIMIT: usize = 100;

/// Topic recorded on readings posted over HTTP.
pub const HTTP_INGEST_TOPIC: &str = "http/sensor_data";

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    reader: SnapshotReader,
    store: Arc<HelmetStore>,
    alerts: Arc<AlertLog>,
    stats: Arc<FeedStats>,
    ingest: Option<mpsc::Sender<RawMessage>>,
    started_at: Instant,
}

impl AppState {
    /// Bundle the pipeline handles the server reads from.
    #[must_use]
    pub fn new(
        reader: SnapshotReader,
        store: Arc<HelmetStore>,
        alerts: Arc<AlertLog>,
        stats: Arc<FeedStats>,
    ) -> Self {
        Self {
            reader,
            store,
            alerts,
            stats,
            ingest: None,
            started_at: Instant::now(),
        }
    }

    /// Accept posted readings into the store writer's queue.
    #[must_use]
    pub fn with_ingest(mut self, tx: mpsc::Sender<RawMessage>) -> Self {
        self.ingest = Some(tx);
        self
    }
}

/// Handler errors, rendered as `{"error": ..., "status": ...}`.
#[derive(Debug)]
pub enum ApiError {
    /// The requested helmet has never been seen.
    UnknownHelmet(String),
    /// A posted payload could not be decoded.
    InvalidPayload(DecodeError),
    /// The ingest queue is full.
    IngestBusy,
    /// This server does not accept readings.
    IngestUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::UnknownHelmet(id) => (StatusCode::NOT_FOUND, format!("unknown helmet: {id}")),
            Self::InvalidPayload(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            Self::IngestBusy => (
                StatusCode::SERVICE_UNAVAILABLE,
                "ingest queue is full".to_string(),
            ),
            Self::IngestUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "ingest is not available".to_string(),
            ),
        };
        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    tick: u64,
    helmets: usize,
    feed: FeedStatsSnapshot,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    helmet_id: String,
    readings: Vec<Reading>,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    status: &'static str,
    helmet_id: String,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

/// Build the router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/snapshot", get(snapshot))
        .route("/api/helmets/:id", get(helmet))
        .route("/api/helmets/:id/history", get(history))
        .route("/api/alerts", get(alerts))
        .route("/api/sensor_data", post(sensor_data))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        tick: state.reader.current().tick,
        helmets: state.store.len(),
        feed: state.stats.snapshot(),
    })
}

async fn snapshot(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.reader.current().as_ref().clone())
}

async fn helmet(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<HelmetStatus>, ApiError> {
    state
        .reader
        .current()
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(ApiError::UnknownHelmet(id))
}

async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> std::result::Result<Json<HistoryResponse>, ApiError> {
    let mut readings = state
        .store
        .history(&id)
        .ok_or_else(|| ApiError::UnknownHelmet(id.clone()))?;
    if let Some(limit) = query.limit {
        let skip = readings.len().saturating_sub(limit);
        readings.drain(..skip);
    }
    Ok(Json(HistoryResponse {
        helmet_id: id,
        readings,
    }))
}

async fn alerts(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<Vec<Alert>> {
    Json(state.alerts.recent(query.limit.unwrap_or(DEFAULT_ALERT_LIMIT)))
}

/// Queue a posted reading for the store writer.
///
/// The payload is decoded up front so the caller learns about bad input; a
/// missing timestamp is stamped with the arrival time.
async fn sensor_data(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let tx = state.ingest.as_ref().ok_or(ApiError::IngestUnavailable)?;
    let received_at = Utc::now();
    let reading = codec::decode(HTTP_INGEST_TOPIC, &body, received_at).map_err(|e| {
        warn!(topic = HTTP_INGEST_TOPIC, error = %e, "rejecting posted reading");
        ApiError::InvalidPayload(e)
    })?;

    let message = RawMessage {
        topic: HTTP_INGEST_TOPIC.to_string(),
        payload: body.to_vec(),
        received_at,
    };
    tx.try_send(message).map_err(|e| match e {
        TrySendError::Full(_) => ApiError::IngestBusy,
        TrySendError::Closed(_) => ApiError::IngestUnavailable,
    })?;
    state.stats.record_received();
    debug!(helmet_id = %reading.helmet_id, "queued posted reading");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            helmet_id: reading.helmet_id,
        }),
    ))
}

/// Bind the server socket.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr).await?)
}

/// Serve on `listener` until shutdown is signalled.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: ShutdownHandle) -> Result<()> {
    info!(addr = %listener.local_addr()?, "snapshot server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.stopped().await })
        .await?;
    info!("snapshot server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::sample_values;
    use crate::risk::{RiskLevel, ThresholdTable};
    use crate::snapshot;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    struct Fixture {
        state: AppState,
        publisher: snapshot::SnapshotPublisher,
    }

    fn fixture() -> Fixture {
        let (publisher, reader) = snapshot::channel();
        let store = Arc::new(HelmetStore::default());
        let alerts = Arc::new(AlertLog::default());
        let stats = Arc::new(FeedStats::default());
        Fixture {
            state: AppState::new(reader, store, alerts, stats),
            publisher,
        }
    }

    fn publish_danger(fixture: &Fixture) {
        let mut values = sample_values();
        values.co2 = 900.0;
        let reading = Reading::live("HELMET_001", values, Utc::now());
        fixture.state.store.append(&reading.helmet_id, reading.clone()).unwrap();
        let assessment = ThresholdTable::default().assess_values(&reading.values);
        fixture.state.alerts.observe(1, Utc::now(), "HELMET_001", &assessment, reading.source);
        let status = HelmetStatus::new(reading, assessment, None);
        fixture.publisher.publish(Snapshot::new(
            1,
            Utc::now(),
            BTreeMap::from([("HELMET_001".to_string(), status)]),
        ));
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post_json(state: AppState, uri: &str, body: &'static [u8]) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    const POSTED: &[u8] =
        br#"{"helmet_id":"HELMET_003","co2":450,"ch4":0.4,"o2":20.8,"h2s":1,"temp":24,"humidity":55}"#;

    #[tokio::test]
    async fn test_post_sensor_data_queues_reading() {
        let fixture = fixture();
        let (tx, mut rx) = mpsc::channel(4);
        let state = fixture.state.clone().with_ingest(tx);

        let before = Utc::now();
        let (status, body) = post_json(state, "/api/sensor_data", POSTED).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["helmet_id"], "HELMET_003");

        let message = rx.try_recv().unwrap();
        assert_eq!(message.topic, HTTP_INGEST_TOPIC);
        assert_eq!(message.payload, POSTED);
        assert!(message.received_at >= before);
        assert_eq!(fixture.state.stats.snapshot().received, 1);

        // The store writer sees the same message a broker delivery would give it.
        crate::listener::ingest(&fixture.state.store, &message).unwrap();
        let stored = fixture.state.store.latest("HELMET_003").unwrap();
        assert!(stored.is_live());
        assert_eq!(stored.timestamp, message.received_at);
    }

    #[tokio::test]
    async fn test_post_malformed_sensor_data_is_400() {
        let fixture = fixture();
        let (tx, mut rx) = mpsc::channel(4);
        let state = fixture.state.clone().with_ingest(tx);

        let bad: &[u8] =
            br#"{"helmet_id":"HELMET_003","co2":"high","ch4":0.4,"o2":20.8,"h2s":1,"temp":24,"humidity":55}"#;
        let (status, body) = post_json(state.clone(), "/api/sensor_data", bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().unwrap().contains("'co2' is not numeric"));

        let (status, _) = post_json(state, "/api/sensor_data", b"not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(rx.try_recv().is_err());
        assert_eq!(fixture.state.stats.snapshot().received, 0);
    }

    #[tokio::test]
    async fn test_post_sensor_data_unavailable() {
        let fixture = fixture();
        let (status, body) = post_json(fixture.state.clone(), "/api/sensor_data", POSTED).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "ingest is not available");

        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(RawMessage {
            topic: HTTP_INGEST_TOPIC.to_string(),
            payload: POSTED.to_vec(),
            received_at: Utc::now(),
        })
        .unwrap();
        let state = fixture.state.clone().with_ingest(tx);
        let (status, body) = post_json(state.clone(), "/api/sensor_data", POSTED).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "ingest queue is full");

        rx.close();
        while rx.try_recv().is_ok() {}
        let (status, _) = post_json(state, "/api/sensor_data", POSTED).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health() {
        let fixture = fixture();
        let (status, body) = get_json(fixture.state.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tick"], 0);
        assert_eq!(body["feed"]["state"], "DISCONNECTED");
    }

    #[tokio::test]
    async fn test_empty_snapshot_before_first_tick() {
        let fixture = fixture();
        let (status, body) = get_json(fixture.state.clone(), "/api/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tick"], 0);
        assert!(body["helmets"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_after_publish() {
        let fixture = fixture();
        publish_danger(&fixture);

        let (_, body) = get_json(fixture.state.clone(), "/api/snapshot").await;
        assert_eq!(body["tick"], 1);
        assert_eq!(body["summary"]["danger"], 1);
        assert_eq!(body["helmets"]["HELMET_001"]["source"], "LIVE");
    }

    #[tokio::test]
    async fn test_helmet_found() {
        let fixture = fixture();
        publish_danger(&fixture);

        let (status, body) = get_json(fixture.state.clone(), "/api/helmets/HELMET_001").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["risk"], RiskLevel::Danger.to_string());
    }

    #[tokio::test]
    async fn test_unknown_helmet_is_404() {
        let fixture = fixture();
        let (status, body) = get_json(fixture.state.clone(), "/api/helmets/HELMET_404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);
        assert_eq!(body["error"], "unknown helmet: HELMET_404");

        let (status, _) = get_json(fixture.state.clone(), "/api/helmets/HELMET_404/history").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_history_with_limit() {
        let fixture = fixture();
        for co2 in [400.0, 410.0, 420.0] {
            let mut values = sample_values();
            values.co2 = co2;
            fixture
                .state
                .store
                .append("HELMET_001", Reading::live("HELMET_001", values, Utc::now()))
                .unwrap();
        }

        let (_, body) = get_json(fixture.state.clone(), "/api/helmets/HELMET_001/history").await;
        assert_eq!(body["readings"].as_array().unwrap().len(), 3);

        let (_, body) =
            get_json(fixture.state.clone(), "/api/helmets/HELMET_001/history?limit=2").await;
        let readings = body["readings"].as_array().unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1]["co2"], 420.0);
    }

    #[tokio::test]
    async fn test_alerts() {
        let fixture = fixture();
        publish_danger(&fixture);

        let (status, body) = get_json(fixture.state.clone(), "/api/alerts").await;
        assert_eq!(status, StatusCode::OK);
        let alerts = body.as_array().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["kind"], "raised");
        assert_eq!(alerts[0]["breached"][0], "co2");
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let fixture = fixture();
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let shutdown = ShutdownHandle::new();
        let task = tokio::spawn(serve(listener, fixture.state.clone(), shutdown.clone()));

        shutdown.stop();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();
    }
}
