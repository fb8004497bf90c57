use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    assignment::AssignmentEngine,
    bus::{MessageBus, WuKongImBus},
    config::{HandoffConfig, SessionCacheBackend, SessionConfig},
    error::{HandoffError, Result},
    liveness::{LivenessCache, MemoryLivenessCache, PgLivenessCache, SessionManager},
    reconciler::SessionReconciler,
    store::{pg, PgStore},
    sweeper::QueueSweeper,
    types::*,
};

const DEFAULT_QUEUE_PAGE: i64 = 20;
const MAX_QUEUE_PAGE: i64 = 100;

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "now": Utc::now().to_rfc3339(),
        "sessionTracking": state.sessions.is_some(),
    }))
}

async fn transfer_to_staff(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TransferBody>,
) -> Result<Json<TransferResult>> {
    let req = TransferRequest {
        target_staff_id: body.target_staff_id,
        add_to_queue_if_no_staff: body.add_to_queue_if_no_staff,
        ai_disabled: body.ai_disabled,
        ..TransferRequest::new(body.project_id, body.visitor_id)
    };
    let result = state.engine.transfer_to_staff(req).await?;
    Ok(Json(result))
}

async fn post_ai_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<AiServiceEvent>,
) -> Result<Response> {
    match event {
        AiServiceEvent::ManualServiceRequest {
            visitor_id,
            payload,
        } => {
            let outcome = state
                .engine
                .request_manual_service(visitor_id, payload.reason)
                .await?;
            Ok(Json(json!({
                "event_type": "manual_service.request",
                "result": outcome,
            }))
            .into_response())
        }
    }
}

async fn post_visitor_message(
    Path((project_id, visitor_id)): Path<(Uuid, Uuid)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<VisitorMessageBody>,
) -> Result<Response> {
    if body.text.trim().is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "text is required" })),
        )
            .into_response());
    }
    let outcome = state
        .engine
        .on_visitor_message(project_id, visitor_id, &body.text)
        .await?;
    Ok(Json(outcome).into_response())
}

async fn close_visitor_session(
    Path((project_id, visitor_id)): Path<(Uuid, Uuid)>,
    State(state): State<Arc<AppState>>,
    raw: Bytes,
) -> Result<Response> {
    // The body is optional; an empty POST closes without naming the staff member.
    let body = if raw.iter().all(u8::is_ascii_whitespace) {
        CloseSessionBody::default()
    } else {
        match serde_json::from_slice::<CloseSessionBody>(&raw) {
            Ok(body) => body,
            Err(err) => {
                return Ok((
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("invalid body: {err}") })),
                )
                    .into_response())
            }
        }
    };
    let visitor = state
        .engine
        .close_session(project_id, visitor_id, body.closed_by_staff_id)
        .await?;
    Ok(Json(json!({ "visitor": visitor })).into_response())
}

async fn list_queue(
    Path(project_id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<QueueListQuery>,
) -> Result<impl IntoResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_QUEUE_PAGE)
        .clamp(1, MAX_QUEUE_PAGE);
    let offset = query.offset.unwrap_or(0).max(0);
    let (items, total) = state.engine.list_queue(project_id, limit, offset).await?;
    Ok(Json(json!({ "items": items, "total": total })))
}

async fn queue_stats(
    Path(project_id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueCounts>> {
    Ok(Json(state.engine.queue_stats(project_id).await?))
}

async fn queue_position(
    Path((project_id, entry_id)): Path<(Uuid, Uuid)>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    let position = state.engine.queue_position(project_id, entry_id).await?;
    Ok(Json(json!({ "position": position })))
}

async fn accept_queue_entry(
    Path((project_id, entry_id)): Path<(Uuid, Uuid)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AcceptQueueBody>,
) -> Result<Json<TransferResult>> {
    let result = state
        .engine
        .accept_from_queue(project_id, entry_id, body.staff_id)
        .await?;
    Ok(Json(result))
}

async fn leave_queue(
    Path((project_id, entry_id)): Path<(Uuid, Uuid)>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    let entry = state.engine.leave_queue(project_id, entry_id).await?;
    Ok(Json(json!({ "entry": entry })))
}

async fn live_sessions(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let Some(sessions) = &state.sessions else {
        return Ok(Json(json!({ "enabled": false, "visitorIds": [] })));
    };
    let visitor_ids = sessions.live_sessions().await?;
    Ok(Json(json!({ "enabled": true, "visitorIds": visitor_ids })))
}

pub fn router(state: Arc<AppState>) -> Router {
    let timeout = state.config.request_timeout;
    let api = Router::new()
        .route("/transfer/to-staff", post(transfer_to_staff))
        .route("/events", post(post_ai_event))
        .route(
            "/projects/{project_id}/visitors/{visitor_id}/messages",
            post(post_visitor_message),
        )
        .route(
            "/projects/{project_id}/visitors/{visitor_id}/close",
            post(close_visitor_session),
        )
        .route("/projects/{project_id}/queue", get(list_queue))
        .route("/projects/{project_id}/queue/stats", get(queue_stats))
        .route(
            "/projects/{project_id}/queue/{entry_id}",
            delete(leave_queue),
        )
        .route(
            "/projects/{project_id}/queue/{entry_id}/position",
            get(queue_position),
        )
        .route(
            "/projects/{project_id}/queue/{entry_id}/accept",
            post(accept_queue_entry),
        )
        .route("/sessions/live", get(live_sessions));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Owns the sweeper and reconciler loops and stops them together.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            handles: Vec::new(),
        }
    }

    pub fn spawn_sweeper(&mut self, sweeper: Arc<QueueSweeper>) {
        self.handles
            .push(tokio::spawn(sweeper.run(self.cancel.child_token())));
    }

    pub fn spawn_reconciler(&mut self, reconciler: Arc<SessionReconciler>) {
        self.handles
            .push(tokio::spawn(reconciler.run(self.cancel.child_token())));
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        debug!("background tasks stopped");
    }
}

/// Cancels `shutdown` on the first SIGINT or SIGTERM. The HTTP server and
/// both background loops watch that token.
pub fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!(signal, "shutdown requested");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, only Ctrl+C stops the server");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("handoff_server={log_level},tower_http=warn"))
    });

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Builds the liveness-backed session manager, or None when human sessions
/// cannot time out in this process.
async fn session_manager(config: &SessionConfig, db: &PgPool) -> Option<Arc<SessionManager>> {
    let cache: Arc<dyn LivenessCache> = match config.backend {
        SessionCacheBackend::Off => {
            warn!("session cache disabled, human sessions will not time out");
            return None;
        }
        SessionCacheBackend::Memory => Arc::new(MemoryLivenessCache::new()),
        SessionCacheBackend::Postgres => Arc::new(PgLivenessCache::new(db.clone())),
    };
    if let Err(e) = cache.ping().await {
        warn!(error = %e, "session cache unreachable, human session timeout is disabled");
        return None;
    }
    info!(backend = ?config.backend, ttl_secs = config.ttl.as_secs(), "human session tracking enabled");
    Some(Arc::new(SessionManager::new(cache, config.ttl)))
}

pub async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = HandoffConfig::from_env()?;
    init_tracing(&config.log_level);

    let db = pg::connect(&config.database_url, config.request_timeout).await?;
    let store = Arc::new(PgStore::new(db.clone()));
    let bus: Arc<dyn MessageBus> = Arc::new(WuKongImBus::new(
        &config.wukongim_url,
        &config.wukongim_api_key,
        config.request_timeout,
    )?);
    let sessions = session_manager(&config.session, &db).await;

    let engine = AssignmentEngine::new(store.clone(), store.clone(), store.clone(), bus.clone())
        .with_sessions(sessions.clone());

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());
    let mut tasks = BackgroundTasks::new(shutdown.clone());
    tasks.spawn_sweeper(Arc::new(QueueSweeper::new(
        store.clone(),
        store.clone(),
        config.queue.clone(),
    )));
    if let Some(sessions) = &sessions {
        tasks.spawn_reconciler(Arc::new(SessionReconciler::new(
            store.clone(),
            sessions.clone(),
            bus,
            config.session.reconcile_interval,
        )));
    }

    let port = config.port;
    let state = Arc::new(AppState {
        engine: Arc::new(engine),
        sessions,
        config,
    });
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| HandoffError::Config(format!("failed to bind {addr}: {e}")))?;

    info!(%addr, "handoff server listening");
    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;

    tasks.shutdown().await;
    db.close().await;
    served.map_err(|e| HandoffError::upstream("http server", e))?;
    info!("handoff server stopped");
    Ok(())
}
