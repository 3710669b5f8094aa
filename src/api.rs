//! HTTP surface for UIs and companion devices.
//!
//! Thin adapter over the core: every handler calls one service operation
//! and maps its error kind to a status code. Live events stream over SSE.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::app::Daybreak;
use crate::cache::{AudioCache, HealthReport};
use crate::clock::{Clock, SharedClock};
use crate::dismissal::{DismissalCoordinator, RingingAlarm};
use crate::error::ErrorKind;
use crate::events::{CoreEvent, EventBus};
use crate::generation::ContentOrchestrator;
use crate::history::HistoryLog;
use crate::model::{Alarm, AlarmId, Intent, IntentId, Tone};
use crate::scheduling::{NewAlarm, SchedulingService};

#[derive(Clone)]
pub struct ApiState {
    pub scheduling: Arc<SchedulingService>,
    pub orchestrator: Arc<ContentOrchestrator>,
    pub coordinator: Arc<DismissalCoordinator>,
    pub cache: Arc<AudioCache>,
    pub events: Arc<EventBus>,
    pub history: Arc<HistoryLog>,
    pub clock: SharedClock,
}

impl ApiState {
    pub fn from_app(app: &Daybreak) -> Self {
        Self {
            scheduling: app.scheduling.clone(),
            orchestrator: app.orchestrator.clone(),
            coordinator: app.coordinator.clone(),
            cache: app.cache.clone(),
            events: app.events.clone(),
            history: app.history.clone(),
            clock: app.clock(),
        }
    }
}

// --- Request/Response types ---

#[derive(Deserialize, Default)]
struct ToggleRequest {
    #[serde(default)]
    enabled: Option<bool>,
}

#[derive(Deserialize)]
struct VoiceRequest {
    transcript: String,
}

#[derive(Deserialize)]
struct IntentRequest {
    text: String,
    #[serde(default)]
    tone: Tone,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Deserialize)]
struct ReportQuery {
    #[serde(default = "default_report_date")]
    date: String,
}

fn default_report_date() -> String {
    "today".to_string()
}

#[derive(Serialize)]
struct StatusResponse {
    alarms: usize,
    enabled: usize,
    timezone: Tz,
    ringing: Vec<RingingAlarm>,
    cache: HealthReport,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            error: None,
        }
    }
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn from_kind(kind: ErrorKind, message: impl ToString) -> Self {
        Self::new(status_for(kind), message.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = SimpleResponse {
            status: "error".into(),
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadySatisfied => StatusCode::CONFLICT,
        ErrorKind::ContentInvalid => StatusCode::BAD_GATEWAY,
        ErrorKind::Transient | ErrorKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::FatalConfiguration => StatusCode::FORBIDDEN,
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/alarms", get(handle_list_alarms).post(handle_create_alarm))
        .route("/alarms/{id}", get(handle_get_alarm).delete(handle_delete_alarm))
        .route("/alarms/{id}/toggle", post(handle_toggle))
        .route("/alarms/{id}/generate", post(handle_generate))
        .route("/alarms/{id}/dismiss", post(handle_dismiss))
        .route("/alarms/{id}/snooze", post(handle_snooze))
        .route("/alarms/{id}/voice", post(handle_voice))
        .route("/intents", get(handle_list_intents).post(handle_create_intent))
        .route("/cache/health", get(handle_cache_health))
        .route("/events", get(handle_events))
        .route("/report", get(handle_report))
        .with_state(state)
}

/// Start the API server as a background tokio task. Returns the bound
/// address, or `None` when the listener could not be created.
pub async fn start_api(state: ApiState, bind: &str, port: u16) -> Option<SocketAddr> {
    let app = router(state);
    let addr = format!("{bind}:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind API on {addr}: {e}");
            return None;
        }
    };
    let local = listener.local_addr().ok();
    info!("API server listening on {}", local.map_or(addr, |a| a.to_string()));

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("API server error: {e}");
        }
    });
    local
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let alarms = state.scheduling.repository().list().await;
    Json(StatusResponse {
        alarms: alarms.len(),
        enabled: alarms.iter().filter(|a| a.enabled).count(),
        timezone: state.scheduling.current_timezone(),
        ringing: state.coordinator.ringing(),
        cache: state.cache.health(),
    })
}

async fn handle_list_alarms(State(state): State<ApiState>) -> Json<Vec<Alarm>> {
    Json(state.scheduling.repository().list().await)
}

async fn handle_get_alarm(State(state): State<ApiState>, Path(id): Path<AlarmId>) -> ApiResult<Json<Alarm>> {
    state
        .scheduling
        .repository()
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown alarm {id}")))
}

async fn handle_create_alarm(
    State(state): State<ApiState>,
    Json(req): Json<NewAlarm>,
) -> ApiResult<(StatusCode, Json<Alarm>)> {
    info!("HTTP /alarms: \"{}\" at {}", req.label, req.time);
    let alarm = state
        .scheduling
        .create_alarm(req)
        .await
        .map_err(|e| ApiError::from_kind(e.kind(), e))?;
    Ok((StatusCode::CREATED, Json(alarm)))
}

async fn handle_delete_alarm(State(state): State<ApiState>, Path(id): Path<AlarmId>) -> ApiResult<Json<Alarm>> {
    state
        .scheduling
        .delete_alarm(id)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_kind(e.kind(), e))
}

async fn handle_toggle(
    State(state): State<ApiState>,
    Path(id): Path<AlarmId>,
    body: Bytes,
) -> ApiResult<Json<Alarm>> {
    // An empty body flips the current state.
    let req: ToggleRequest = if body.is_empty() {
        ToggleRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?
    };
    state
        .scheduling
        .toggle_alarm(id, req.enabled)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_kind(e.kind(), e))
}

async fn handle_generate(
    State(state): State<ApiState>,
    Path(id): Path<AlarmId>,
) -> ApiResult<Json<SimpleResponse>> {
    let alarm = state
        .scheduling
        .repository()
        .get(id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown alarm {id}")))?;

    // Runs in the background; progress arrives as generation events.
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.generate(alarm.id, alarm.intent_id).await {
            warn!("Requested generation for alarm {} failed: {e}", alarm.id);
        }
    });
    Ok(Json(SimpleResponse::ok("generating")))
}

async fn handle_dismiss(State(state): State<ApiState>, Path(id): Path<AlarmId>) -> ApiResult<Json<SimpleResponse>> {
    state
        .coordinator
        .dismiss(id)
        .await
        .map_err(|e| ApiError::from_kind(e.kind(), e))?;
    Ok(Json(SimpleResponse::ok("dismissing")))
}

async fn handle_snooze(State(state): State<ApiState>, Path(id): Path<AlarmId>) -> ApiResult<Json<SimpleResponse>> {
    state
        .coordinator
        .snooze(id)
        .await
        .map_err(|e| ApiError::from_kind(e.kind(), e))?;
    Ok(Json(SimpleResponse::ok("snoozing")))
}

async fn handle_voice(
    State(state): State<ApiState>,
    Path(id): Path<AlarmId>,
    Json(req): Json<VoiceRequest>,
) -> ApiResult<Json<SimpleResponse>> {
    debug!("HTTP voice for {id}: \"{}\"", req.transcript);
    state
        .coordinator
        .submit_voice(id, req.transcript)
        .await
        .map_err(|e| ApiError::from_kind(e.kind(), e))?;
    Ok(Json(SimpleResponse::ok("heard")))
}

async fn handle_list_intents(State(state): State<ApiState>) -> Json<Vec<Intent>> {
    Json(state.scheduling.repository().intents().await)
}

async fn handle_create_intent(
    State(state): State<ApiState>,
    Json(req): Json<IntentRequest>,
) -> ApiResult<(StatusCode, Json<Intent>)> {
    let text = req.text.trim();
    if text.is_empty() {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "empty intent text"));
    }
    let intent = Intent {
        id: IntentId::new(),
        text: text.to_string(),
        tone: req.tone,
        context: req.context.filter(|c| !c.trim().is_empty()),
        created_at: state.clock.now(),
    };
    state
        .scheduling
        .repository()
        .add_intent(intent.clone())
        .await
        .map_err(|e| ApiError::from_kind(e.kind(), e))?;
    Ok((StatusCode::CREATED, Json(intent)))
}

async fn handle_cache_health(State(state): State<ApiState>) -> Json<HealthReport> {
    Json(state.cache.health())
}

async fn handle_report(State(state): State<ApiState>, Query(query): Query<ReportQuery>) -> Response {
    let report = state.history.report(&query.date);
    ([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], report).into_response()
}

fn event_name(event: &CoreEvent) -> &'static str {
    match event {
        CoreEvent::AlarmChanged { .. } => "alarm_changed",
        CoreEvent::AlarmDeleted { .. } => "alarm_deleted",
        CoreEvent::Generation { .. } => "generation",
        CoreEvent::Ringing { .. } => "ringing",
        CoreEvent::Dismissal { .. } => "dismissal",
        CoreEvent::CacheHealth { .. } => "cache_health",
    }
}

async fn handle_events(State(state): State<ApiState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|received| {
        // Lagged receivers skip what they missed.
        let event = received.ok()?;
        match Event::default().event(event_name(&event)).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                warn!("Failed to encode event for SSE: {e}");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dismissal::DismissalState;
    use crate::model::{DismissMethod, ScheduleState};
    use crate::testing::{wait_until, Harness};

    async fn serve(h: &Harness) -> String {
        let state = ApiState {
            scheduling: h.service.clone(),
            orchestrator: h.orchestrator.clone(),
            coordinator: h.coordinator.clone(),
            cache: h.cache.clone(),
            events: h.events.clone(),
            history: h.history.clone(),
            clock: h.clock.clone(),
        };
        let addr = start_api(state, "127.0.0.1", 0).await.unwrap();
        format!("http://{addr}")
    }

    #[test]
    fn error_kinds_map_to_status_codes() {
        assert_eq!(status_for(ErrorKind::Validation), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::FatalConfiguration), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::ResourceExhausted), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn creates_lists_and_deletes_alarms() {
        let h = Harness::new().await;
        let base = serve(&h).await;
        let client = reqwest::Client::new();

        let created = client
            .post(format!("{base}/alarms"))
            .json(&serde_json::json!({
                "label": "Gym",
                "time": "06:30:00",
                "timezone": "UTC",
                "repeat": ["Mon", "Wed"],
                "tone": "energetic",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), reqwest::StatusCode::CREATED);
        let alarm: serde_json::Value = created.json().await.unwrap();
        assert_eq!(alarm["label"], "Gym");
        assert_eq!(alarm["schedule_state"], "scheduled");
        let id = alarm["id"].as_str().unwrap().to_string();

        let listed: Vec<serde_json::Value> = client
            .get(format!("{base}/alarms"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        let toggled: serde_json::Value = client
            .post(format!("{base}/alarms/{id}/toggle"))
            .json(&serde_json::json!({ "enabled": false }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(toggled["enabled"], false);

        let deleted = client.delete(format!("{base}/alarms/{id}")).send().await.unwrap();
        assert_eq!(deleted.status(), reqwest::StatusCode::OK);
        let missing = client.get(format!("{base}/alarms/{id}")).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        assert!(h.repo.list().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_past_one_shot_with_validation_status() {
        let h = Harness::new().await;
        let base = serve(&h).await;
        let response = reqwest::Client::new()
            .post(format!("{base}/alarms"))
            .json(&serde_json::json!({
                "label": "Yesterday",
                "time": "07:00:00",
                "timezone": "UTC",
                "date": "2025-06-01",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn dismiss_requires_a_ringing_alarm() {
        let h = Harness::new().await;
        let base = serve(&h).await;
        let id = AlarmId::new();
        let response = reqwest::Client::new()
            .post(format!("{base}/alarms/{id}/dismiss"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn voice_transcript_dismisses_ringing_alarm() {
        let h = Harness::new().await;
        let base = serve(&h).await;
        let request: NewAlarm = serde_json::from_value(serde_json::json!({
            "label": "Voice",
            "time": "07:00:00",
            "timezone": "UTC",
            "repeat": ["Mon"],
        }))
        .unwrap();
        let alarm = h.service.create_alarm(request).await.unwrap();
        let handle = alarm.valid_handle().unwrap().clone();
        h.clock.set(handle.pushed.fire_at);
        let event = h.host.fire(&handle.host_id).unwrap();
        let session = h.coordinator.handle_fire(event).await.unwrap();
        h.coordinator
            .wait_for_state(alarm.id, |s| matches!(s, DismissalState::AwaitingConfirmation { .. }))
            .await;

        let client = reqwest::Client::new();
        let status: serde_json::Value = client
            .get(format!("{base}/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["ringing"].as_array().unwrap().len(), 1);

        let response = client
            .post(format!("{base}/alarms/{}/voice", alarm.id))
            .json(&serde_json::json!({ "transcript": "okay, I'm up!" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let record = session.await.unwrap().unwrap();
        assert_eq!(record.method, Some(DismissMethod::Voice));
        let repo = h.repo.clone();
        wait_until(|| {
            let repo = repo.clone();
            async move {
                repo.get(alarm.id)
                    .await
                    .is_some_and(|a| a.schedule_state == ScheduleState::Scheduled)
            }
        })
        .await;
    }

    #[tokio::test]
    async fn creates_intents_and_serves_report() {
        let h = Harness::new().await;
        let base = serve(&h).await;
        let client = reqwest::Client::new();

        let empty = client
            .post(format!("{base}/intents"))
            .json(&serde_json::json!({ "text": "   " }))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);

        let created = client
            .post(format!("{base}/intents"))
            .json(&serde_json::json!({ "text": "Run 5k", "tone": "calm", "context": "race day" }))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), reqwest::StatusCode::CREATED);
        assert_eq!(h.repo.intents().await.len(), 1);

        let report = client
            .get(format!("{base}/report?date=1999-01-01"))
            .send()
            .await
            .unwrap();
        assert!(report
            .headers()
            .get(header::CONTENT_TYPE)
            .is_some_and(|v| v.to_str().unwrap().starts_with("text/markdown")));
        let body = report.text().await.unwrap();
        assert!(body.starts_with("# Daybreak Report - 1999-01-01"));

        let health: serde_json::Value = client
            .get(format!("{base}/cache/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["entry_count"], 0);
    }
}
