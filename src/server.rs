//! HTTP server: management endpoints behind the redirect middleware.
//!
//! Every request first passes through [`redirect_middleware`]; only
//! requests that do not resolve to a redirect reach the routes below or
//! the JSON 404 fallback.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version and index size) |
//! | `POST` | `/_redirects/content-export` | Derive and consolidate redirects from a content update |
//! | `POST` | `/_redirects/flatten` | Collapse redirect chains in every dimension |
//! | `POST` | `/_redirects/reload` | Reload the redirect index from the store |
//! | `GET`  | `/_redirects` | Active redirects keyed by dimension and source |
//! | `GET`  | `/_redirects/search` | Filtered listing (`dimension`, `sourceContains`, `redirectionType`, `active`) |
//! | `POST` | `/_redirects/manual` | Create a manual redirect |
//! | `PUT`  | `/_redirects/manual/{id}` | Replace a redirect |
//! | `DELETE` | `/_redirects/manual/{id}` | Delete a redirect |
//! | `POST` | `/_redirects/state` | Activate or deactivate redirects by id |
//!
//! The acting user is read from the `X-Redirects-User` header.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid input: source must not be /" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `store_unavailable` (503).

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use redirects_core::store::{DimensionSnapshot, SearchFilter};
use redirects_core::{EntityId, RedirectDefinition, RedirectError};

use crate::api::{ApiOptions, NewRedirect, RedirectsApi};
use crate::commands::{Changes, ContentState};
use crate::config::Config;
use crate::index::RedirectIndex;
use crate::middleware::{redirect_middleware, RedirectLayer};
use crate::resolver::{HostDimensionProvider, RequestResolver};
use crate::signal::UpdateSignal;
use crate::sqlite_store::SqliteStore;

const USER_HEADER: &str = "x-redirects-user";

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub api: Arc<RedirectsApi>,
    pub index: Arc<RedirectIndex>,
}

/// Builds the router with the redirect middleware wrapped around every
/// route and the fallback.
pub fn build_router(state: AppState, redirects: RedirectLayer) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/_redirects", get(handle_list))
        .route("/_redirects/search", get(handle_search))
        .route("/_redirects/content-export", post(handle_content_export))
        .route("/_redirects/flatten", post(handle_flatten))
        .route("/_redirects/reload", post(handle_reload))
        .route("/_redirects/state", post(handle_update_state))
        .route("/_redirects/manual", post(handle_create))
        .route(
            "/_redirects/manual/{id}",
            put(handle_update).delete(handle_delete),
        )
        .fallback(handle_fallback)
        .with_state(state)
        .layer(from_fn_with_state(redirects, redirect_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Starts the HTTP server.
///
/// Opens the database, runs migrations, loads the redirect index, starts
/// the reload loop and serves on `[server].bind` until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(&config.db).await?;
    crate::migrate::migrate_pool(&pool).await?;

    let store = Arc::new(SqliteStore::from_config(pool, &config.store));
    let signal = UpdateSignal::new();

    let index = Arc::new(RedirectIndex::new(store.clone(), config.store.timeout()));
    let loaded = index.load().await?;
    let reloader = index.spawn_reloader(signal.subscribe(), config.index.poll_interval());

    let resolver = Arc::new(RequestResolver::from_config(index.clone(), &config.resolver)?);
    let dimensions = Arc::new(HostDimensionProvider::from_config(&config.dimensions));
    let api = Arc::new(RedirectsApi::new(
        store,
        Arc::new(signal),
        ApiOptions::from_config(config),
    )?);

    let app = build_router(
        AppState {
            api,
            index: index.clone(),
        },
        RedirectLayer::new(resolver, dimensions),
    );

    info!(bind = %config.server.bind, redirects = loaded, "redirects server listening");

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    reloader.shutdown().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RedirectError> for AppError {
    fn from(err: RedirectError) -> Self {
        let (status, code) = match &err {
            RedirectError::InvalidInput(_) | RedirectError::MalformedRequest(_) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            RedirectError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            RedirectError::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

fn user(headers: &HeaderMap) -> Option<&str> {
    headers.get(USER_HEADER).and_then(|v| v.to_str().ok())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    redirects: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        redirects: state.index.len(),
    })
}

// ============ Fallback ============

async fn handle_fallback() -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: "no route or redirect matches this request".to_string(),
    }
}

// ============ Queries ============

async fn handle_list(State(state): State<AppState>) -> Result<Json<DimensionSnapshot>, AppError> {
    Ok(Json(state.api.get_redirects().await?))
}

async fn handle_search(
    State(state): State<AppState>,
    Query(filter): Query<SearchFilter>,
) -> Result<Json<Vec<RedirectDefinition>>, AppError> {
    Ok(Json(state.api.search(&filter).await?))
}

// ============ Commands ============

/// Body of `POST /_redirects/content-export`: dimension → root node.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentExportRequest {
    #[serde(default)]
    old_state: ContentState,
    #[serde(default)]
    new_state: ContentState,
}

async fn handle_content_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ContentExportRequest>,
) -> Result<Json<Changes>, AppError> {
    let changes = state
        .api
        .create_redirects_from_content(body.old_state, body.new_state, user(&headers))
        .await?;
    Ok(Json(changes))
}

async fn handle_flatten(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Changes>, AppError> {
    Ok(Json(state.api.flatten(user(&headers)).await?))
}

#[derive(Serialize)]
struct ReloadResponse {
    redirects: usize,
}

async fn handle_reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, AppError> {
    let redirects = state.index.load().await?;
    Ok(Json(ReloadResponse { redirects }))
}

#[derive(Deserialize)]
struct UpdateStateRequest {
    ids: Vec<EntityId>,
    stale: bool,
}

async fn handle_update_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UpdateStateRequest>,
) -> Result<Json<Changes>, AppError> {
    let changes = state
        .api
        .update_redirects_state(body.ids, body.stale, user(&headers))
        .await?;
    Ok(Json(changes))
}

async fn handle_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewRedirect>,
) -> Result<(StatusCode, Json<RedirectDefinition>), AppError> {
    let definition = state.api.create_redirect(body, user(&headers)).await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

async fn handle_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(mut body): Json<RedirectDefinition>,
) -> Result<Json<RedirectDefinition>, AppError> {
    body.id = EntityId::from(id);
    let definition = state.api.update_redirect(body, user(&headers)).await?;
    Ok(Json(definition))
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.api.delete_redirect(EntityId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
