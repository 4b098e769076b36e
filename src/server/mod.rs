//! HTTP 接口：axum 路由
//!
//! 发起回合的接口（/api/chat/stream、/api/nudge、/api/retry）返回 NDJSON 实时流，每行一个事件；
//! 调用方的超时预算（首个事件 / 终止事件）只影响这条流本身：超时后写一行本地 detached 行并分离，
//! 回合在后台继续，剩余事件进入补取队列（GET /api/events）。

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ServerSection;
use crate::core::{ErrorKind, Session, SessionError, Trigger};
use crate::events::{EventKind, LiveStream};
use crate::memory::{HistoryError, Role};

/// 调用方的超时预算
#[derive(Clone, Copy, Debug)]
pub struct StreamBudget {
    pub first_event: Duration,
    pub terminal: Duration,
}

impl From<&ServerSection> for StreamBudget {
    fn from(cfg: &ServerSection) -> Self {
        Self {
            first_event: Duration::from_secs(cfg.first_event_timeout_secs),
            terminal: Duration::from_secs(cfg.stream_timeout_secs),
        }
    }
}

#[derive(Clone)]
struct AppState {
    session: Arc<Session>,
    budget: StreamBudget,
}

/// 统一错误响应：`{"error": <kind>, "message": <text>, ...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
    extra: serde_json::Value,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "bad_request",
            message: message.into(),
            extra: serde_json::Value::Null,
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let status = match &e {
            SessionError::Busy { .. } => StatusCode::CONFLICT,
            SessionError::RecordNotFound { .. } | SessionError::History(HistoryError::NotFound { .. }) => {
                StatusCode::NOT_FOUND
            }
            SessionError::ReservedMessageId { .. } => StatusCode::BAD_REQUEST,
            SessionError::History(_) | SessionError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let extra = match &e {
            SessionError::Busy { holder } => json!({ "holder": holder }),
            _ => serde_json::Value::Null,
        };
        let error = match &e {
            SessionError::Config(_) => "config",
            SessionError::ReservedMessageId { .. } => "bad_request",
            other => other.kind().as_str(),
        };
        Self {
            status,
            error,
            message: e.to_string(),
            extra,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.error, "message": self.message });
        if let (Some(body), serde_json::Value::Object(extra)) = (body.as_object_mut(), self.extra) {
            body.extend(extra);
        }
        (self.status, Json(body)).into_response()
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Generation => StatusCode::BAD_GATEWAY,
        ErrorKind::Coordinates => StatusCode::NOT_FOUND,
        ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Busy => StatusCode::CONFLICT,
    }
}

pub fn router(session: Arc<Session>, budget: StreamBudget) -> Router {
    let state = AppState { session, budget };
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/chat", post(api_chat))
        .route("/api/chat/stream", post(api_chat_stream))
        .route("/api/nudge", post(api_nudge))
        .route("/api/retry", post(api_retry))
        .route("/api/history", get(api_history))
        .route("/api/history/edit", post(api_history_edit))
        .route("/api/history/clear", post(api_history_clear))
        .route("/api/events", get(api_events))
        .route("/api/events/stream", get(api_events_sse))
        .route("/api/scheduler", get(api_scheduler).post(api_scheduler_configure))
        .route("/api/scheduler/clear", post(api_scheduler_clear))
        .route("/api/config/reload", post(api_config_reload))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// 绑定 host:port（FOREMAN_PORT 可覆盖端口）并服务到 token 取消
pub async fn serve(session: Arc<Session>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let cfg = session.config().await.server;
    let port = std::env::var("FOREMAN_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(cfg.port);
    let app = router(session, StreamBudget::from(&cfg));
    let listener = tokio::net::TcpListener::bind((cfg.host.as_str(), port)).await?;
    tracing::info!("Foreman API: http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// 桌面壳从 file:// 源调用，所有响应都带 CORS 头；预检请求直接 204
async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    response
}

#[derive(Deserialize)]
struct ChatBody {
    #[serde(default, alias = "text")]
    message: String,
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Deserialize, Default)]
struct NudgeBody {
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Deserialize)]
struct RetryBody {
    record_index: u64,
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Deserialize)]
struct EditBody {
    record_index: u64,
    message_index: usize,
    #[serde(default)]
    role: Option<Role>,
    content: String,
}

#[derive(Deserialize, Default)]
struct SchedulerBody {
    #[serde(default)]
    interval_minutes: Option<f64>,
    #[serde(default)]
    delay_minutes: Option<f64>,
}

async fn api_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "busy": state.session.lock().is_busy(),
        "pending_events": state.session.hub().pending(),
    }))
}

/// 启动回合并把实时流写成 NDJSON 响应
async fn start_streaming(state: &AppState, trigger: Trigger, message_id: Option<String>) -> Result<Response, ApiError> {
    let mut handle = state.session.start_turn(trigger, message_id, true).await?;
    let live = handle
        .take_live()
        .ok_or_else(|| ApiError::bad_request("live stream unavailable"))?;
    Ok(ndjson_response(live, state.budget))
}

async fn api_chat_stream(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Result<Response, ApiError> {
    start_streaming(&state, Trigger::Send { text: body.message }, body.message_id).await
}

async fn api_nudge(State(state): State<AppState>, body: Option<Json<NudgeBody>>) -> Result<Response, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    start_streaming(&state, Trigger::Nudge, body.message_id).await
}

async fn api_retry(State(state): State<AppState>, Json(body): Json<RetryBody>) -> Result<Response, ApiError> {
    start_streaming(
        &state,
        Trigger::Retry {
            record_index: body.record_index,
        },
        body.message_id,
    )
    .await
}

/// 调用方本地的超时行：type 为 "detached"，不是 StreamEvent（无 seq），回合的真实终止事件稍后经补取队列到达
fn local_timeout_line(message_id: &str, waited: &str) -> Bytes {
    let line = json!({
        "type": "detached",
        "message_id": message_id,
        "kind": ErrorKind::Timeout,
        "content": format!("no {} within the caller's budget; the turn continues in the background", waited),
    });
    Bytes::from(format!("{}\n", line))
}

struct LiveCursor {
    live: LiveStream,
    seen_first: bool,
    deadline: Instant,
    first_event: Duration,
}

fn ndjson_response(live: LiveStream, budget: StreamBudget) -> Response {
    let cursor = LiveCursor {
        live,
        seen_first: false,
        deadline: Instant::now() + budget.terminal,
        first_event: budget.first_event,
    };
    let body = stream::unfold(Some(cursor), |cursor| async move {
        let mut cursor = cursor?;
        let remaining = cursor.deadline.saturating_duration_since(Instant::now());
        let wait = if cursor.seen_first {
            remaining
        } else {
            remaining.min(cursor.first_event)
        };
        match tokio::time::timeout(wait, cursor.live.next_event()).await {
            Ok(Some(event)) => {
                let line = Bytes::from(event.to_ndjson());
                let next = if event.is_terminal() {
                    None
                } else {
                    cursor.seen_first = true;
                    Some(cursor)
                };
                Some((Ok::<_, Infallible>(line), next))
            }
            Ok(None) => None,
            Err(_) => {
                let waited = if cursor.seen_first { "terminal event" } else { "first event" };
                tracing::warn!(message_id = %cursor.live.message_id(), "live stream budget expired ({}), detaching", waited);
                let line = local_timeout_line(cursor.live.message_id(), waited);
                // cursor 在此 Drop：未读事件转入补取队列
                Some((Ok(line), None))
            }
        }
    });
    let mut response = Response::new(Body::from_stream(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson; charset=utf-8"),
    );
    response
}

/// 阻塞式发送：等待终止事件后一次性返回；超出预算返回 504，回合在后台继续
async fn api_chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Result<Response, ApiError> {
    let mut handle = state
        .session
        .start_turn(Trigger::Send { text: body.message }, body.message_id, true)
        .await?;
    let message_id = handle.message_id.clone();
    let mut live = handle
        .take_live()
        .ok_or_else(|| ApiError::bad_request("live stream unavailable"))?;

    let waited = tokio::time::timeout(state.budget.terminal, async {
        while let Some(event) = live.next_event().await {
            if event.is_terminal() {
                return Some(event.kind);
            }
        }
        None
    })
    .await;

    let response = match waited {
        Ok(Some(EventKind::Done {
            record_index,
            response,
            replaced,
        })) => Json(json!({
            "message_id": message_id,
            "record_index": record_index,
            "response": response.unwrap_or_default(),
            "replaced": replaced,
        }))
        .into_response(),
        Ok(Some(EventKind::Error { kind, content })) => (
            status_for(kind),
            Json(json!({ "error": kind, "message": content, "message_id": message_id })),
        )
            .into_response(),
        Ok(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "generation", "message": "turn ended without a terminal event", "message_id": message_id })),
        )
            .into_response(),
        Err(_) => {
            tracing::warn!(message_id = %message_id, "blocking chat budget expired, turn continues in background");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({
                    "error": ErrorKind::Timeout,
                    "message": "no terminal event within the caller's budget; poll /api/events for the result",
                    "message_id": message_id,
                })),
            )
                .into_response()
        }
    };
    Ok(response)
}

async fn api_history(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.session.history().await))
}

async fn api_history_edit(
    State(state): State<AppState>,
    Json(body): Json<EditBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .session
        .edit(body.record_index, body.message_index, body.role, body.content)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn api_history_clear(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.session.clear().await?;
    Ok(Json(json!({ "ok": true })))
}

async fn api_events(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "events": state.session.poll() }))
}

/// GET /api/events/stream：SSE，推送所有发布的事件
async fn api_events_sse(
    State(state): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.session.hub().subscribe();
    let event_stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let data = serde_json::to_string(&ev).unwrap_or_default();
                    return Some((Ok(Event::default().event(ev.kind.name()).data(data)), rx));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "SSE subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

async fn api_scheduler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.session.scheduler_state().await))
}

async fn api_scheduler_configure(
    State(state): State<AppState>,
    Json(body): Json<SchedulerBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    for (name, value) in [("interval_minutes", body.interval_minutes), ("delay_minutes", body.delay_minutes)] {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(ApiError::bad_request(format!("{} must be a non-negative number", name)));
            }
        }
    }
    let scheduler = state
        .session
        .configure_scheduler(body.interval_minutes, body.delay_minutes)
        .await;
    Ok(Json(json!(scheduler)))
}

async fn api_scheduler_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.session.clear_scheduler().await))
}

async fn api_config_reload(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.session.reload_config().await?;
    Ok(Json(json!({ "ok": true })))
}
