// Entity Registry - Web Server
// REST API with Axum over the SQLite registry, plus the reconciliation
// workers running alongside on blocking threads.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use entity_registry::{
    AttributeRegistry, EntityKey, Matcher, Reconciler, RegistryConfig, Repository, SearchError,
    SearchRequest, SqliteQueue, SqliteRepository, SyncItem, WorkerPool,
};
use entity_registry::temporal::parse_instant;

/// Shared application state
#[derive(Clone)]
struct AppState {
    repository: Arc<SqliteRepository>,
    queue: Arc<SqliteQueue>,
    registry: Arc<AttributeRegistry>,
    entity_types: Arc<Vec<String>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            errors: Vec::new(),
        }
    }
}

fn failure(status: StatusCode, errors: Vec<String>) -> Response {
    let body = ApiResponse::<()> {
        success: false,
        data: None,
        errors,
    };
    (status, Json(body)).into_response()
}

fn internal(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    failure(StatusCode::INTERNAL_SERVER_ERROR, vec![err.to_string()])
}

/// Run blocking registry work off the async executor
async fn blocking<T, F>(f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Response> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(internal)?
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointInTimeQuery {
    point_in_time: Option<String>,
}

impl PointInTimeQuery {
    fn resolve(&self) -> Result<DateTime<Utc>, Response> {
        match self.point_in_time.as_deref() {
            None => Ok(Utc::now()),
            Some(raw) => parse_instant(raw).ok_or_else(|| {
                failure(
                    StatusCode::BAD_REQUEST,
                    vec![format!("pointInTime '{}' is not an RFC 3339 instant", raw)],
                )
            }),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Enqueued {
    id: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/:entity_type/search - Validated attribute search
async fn search(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    Json(request): Json<SearchRequest>,
) -> Response {
    let result = blocking(move || {
        request
            .execute(
                state.repository.as_ref(),
                &state.registry,
                &entity_type,
                &CancellationToken::new(),
            )
            .map_err(|err| match err {
                SearchError::Invalid(problems) => failure(StatusCode::BAD_REQUEST, problems),
                SearchError::Store(err) => internal(err),
            })
    })
    .await;

    match result {
        Ok(response) => Json(ApiResponse::ok(response)).into_response(),
        Err(response) => response,
    }
}

/// GET /api/:entity_type/:source/:id?pointInTime= - Point-in-time read
async fn get_entity(
    State(state): State<AppState>,
    Path((entity_type, source, id)): Path<(String, String, String)>,
    Query(query): Query<PointInTimeQuery>,
) -> Response {
    let at = match query.resolve() {
        Ok(at) => at,
        Err(response) => return response,
    };
    let key = EntityKey::new(entity_type, source, id);

    let result = blocking(move || {
        state
            .repository
            .retrieve(&key, at, &CancellationToken::new())
            .map_err(internal)?
            .ok_or_else(|| failure(StatusCode::NOT_FOUND, vec![format!("{} not found at {}", key, at)]))
    })
    .await;

    match result {
        Ok(version) => Json(ApiResponse::ok(version)).into_response(),
        Err(response) => response,
    }
}

/// GET /api/:entity_type/:source/:id/history - Every version that held the entity
async fn get_history(
    State(state): State<AppState>,
    Path((entity_type, source, id)): Path<(String, String, String)>,
) -> Response {
    let key = EntityKey::new(entity_type, source, id);

    let result = blocking(move || {
        state
            .repository
            .history(&key, &CancellationToken::new())
            .map_err(internal)
    })
    .await;

    match result {
        Ok(history) => Json(ApiResponse::ok(history)).into_response(),
        Err(response) => response,
    }
}

/// POST /api/sync - Enqueue one snapshot for reconciliation
async fn sync(State(state): State<AppState>, Json(item): Json<SyncItem>) -> Response {
    let mut problems = Vec::new();
    let entity = &item.entity;
    if !state
        .entity_types
        .iter()
        .any(|t| t.eq_ignore_ascii_case(&entity.entity_type))
    {
        problems.push(format!("unrecognised entity type '{}'", entity.entity_type));
    }
    if entity.source_system_name.trim().is_empty() {
        problems.push("sourceSystemName is required".to_string());
    }
    if entity.source_system_id.trim().is_empty() {
        problems.push("sourceSystemId is required".to_string());
    }
    if !problems.is_empty() {
        return failure(StatusCode::BAD_REQUEST, problems);
    }

    let result = blocking(move || state.queue.enqueue(&item).map_err(internal)).await;
    match result {
        Ok(id) => (StatusCode::ACCEPTED, Json(ApiResponse::ok(Enqueued { id }))).into_response(),
        Err(response) => response,
    }
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/sync", post(sync))
        .route("/:entity_type/search", post(search))
        .route("/:entity_type/:source/:id", get(get_entity))
        .route("/:entity_type/:source/:id/history", get(get_history))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("entity_registry=info,registry_server=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = std::env::var_os("REGISTRY_CONFIG").map(std::path::PathBuf::from);
    let config = RegistryConfig::load(config_path.as_deref())?;
    let registry = Arc::new(AttributeRegistry::new());
    config.validate(&registry)?;

    let repository = Arc::new(config.open_repository(Arc::clone(&registry))?);
    let queue = Arc::new(config.open_queue()?);

    let matcher = Matcher::new(
        repository.clone() as Arc<dyn Repository>,
        Arc::new(config.profile_set()),
        Arc::clone(&registry),
    )
    .with_page_size(config.search_page_size);
    let reconciler = Reconciler::new(repository.clone(), matcher, config.entity_types.clone());
    let entity_types: Vec<String> = reconciler.entity_types().iter().cloned().collect();

    // Workers run until shutdown
    let cancel = CancellationToken::new();
    let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(reconciler), config.worker_options(false));
    let worker_cancel = cancel.clone();
    let workers = tokio::task::spawn_blocking(move || pool.run(&worker_cancel));

    let state = AppState {
        repository,
        queue,
        registry,
        entity_types: Arc::new(entity_types),
    };

    let addr = std::env::var("REGISTRY_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "registry server listening");

    let shutdown = cancel.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("failed to listen for ctrl-c");
            }
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    let stats = workers.await??;
    info!(processed = stats.processed, rejected = stats.rejected, "registry server stopped");
    Ok(())
}
