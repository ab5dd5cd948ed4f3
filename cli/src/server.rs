use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use fitstat_core::clock::Clock;
use fitstat_core::models::Timestamp;
use fitstat_core::remote::{RemoteTable, RowQuery};
use fitstat_core::tables::{TableError, TableStore};

const BODY_LIMIT: usize = 8 * 1024 * 1024; // 8 MB

#[derive(Clone)]
struct AppState {
    tables: Arc<Mutex<TableStore>>,
    clock: Arc<dyn Clock>,
    api_key: Option<String>,
}

impl AppState {
    /// Run `f` against the table store with the current server time.
    fn with_tables<T>(
        &self,
        f: impl FnOnce(&TableStore, &Timestamp) -> Result<T, TableError>,
    ) -> Result<T, ApiError> {
        let now = self.clock.now();
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        f(&tables, &now).map_err(ApiError::from)
    }
}

type QueryPairs = Query<Vec<(String, String)>>;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(err) => {
                error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<TableError> for ApiError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::Invalid(msg) => Self::BadRequest(msg),
            other => Self::Internal(other.into()),
        }
    }
}

fn table_from_path(name: &str) -> Result<RemoteTable, ApiError> {
    RemoteTable::from_name(name).ok_or_else(|| ApiError::NotFound(format!("Unknown table '{name}'")))
}

fn row_query(pairs: Vec<(String, String)>) -> Result<RowQuery, ApiError> {
    RowQuery::from_query_pairs(pairs).map_err(ApiError::BadRequest)
}

/// Bulk writes must be filtered, as with PostgREST's safe-update mode.
fn require_filter(query: &RowQuery) -> Result<(), ApiError> {
    if query.filters.is_empty() {
        return Err(ApiError::BadRequest(
            "A filter is required for bulk updates and deletes".to_string(),
        ));
    }
    Ok(())
}

fn merge_duplicates(headers: &HeaderMap) -> bool {
    headers
        .get_all("prefer")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|pref| pref.trim() == "resolution=merge-duplicates")
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn select_rows(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(pairs): QueryPairs,
) -> Result<Json<Vec<Value>>, ApiError> {
    let table = table_from_path(&table)?;
    let query = row_query(pairs)?;
    let rows = state.with_tables(|t, _| t.select(table, &query))?;
    Ok(Json(rows))
}

/// Insert one row, or with `Prefer: resolution=merge-duplicates` upsert an
/// array of rows on the table's key.
async fn insert_rows(
    State(state): State<AppState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let table = table_from_path(&table)?;

    if merge_duplicates(&headers) {
        let rows = match body {
            Value::Array(rows) => rows,
            row @ Value::Object(_) => vec![row],
            _ => {
                return Err(ApiError::BadRequest(
                    "Expected a row or an array of rows".to_string(),
                ));
            }
        };
        let count = state.with_tables(|t, now| t.upsert(table, rows, now))?;
        info!(table = table.name(), count, "rows upserted");
        return Ok(StatusCode::CREATED.into_response());
    }

    let row = match body {
        Value::Array(mut rows) if rows.len() == 1 => rows.remove(0),
        row @ Value::Object(_) => row,
        _ => {
            return Err(ApiError::BadRequest(
                "Insert takes exactly one row".to_string(),
            ));
        }
    };
    match state.with_tables(|t, now| t.insert(table, row, now))? {
        Some(created) => Ok((StatusCode::CREATED, Json(vec![created])).into_response()),
        None => Err(ApiError::Conflict(format!(
            "Row already exists in '{}'",
            table.name()
        ))),
    }
}

async fn update_rows(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(pairs): QueryPairs,
    Json(patch): Json<Value>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let table = table_from_path(&table)?;
    let query = row_query(pairs)?;
    require_filter(&query)?;
    let rows = state.with_tables(|t, now| t.update(table, &query, patch, now))?;
    Ok(Json(rows))
}

async fn delete_rows(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(pairs): QueryPairs,
) -> Result<Json<Vec<Value>>, ApiError> {
    let table = table_from_path(&table)?;
    let query = row_query(pairs)?;
    require_filter(&query)?;
    let rows = state.with_tables(|t, _| t.delete(table, &query))?;
    if !rows.is_empty() {
        info!(table = table.name(), count = rows.len(), "rows deleted");
    }
    Ok(Json(rows))
}

fn build_router(state: AppState) -> Router {
    let rest = Router::new()
        .route(
            "/rest/v1/{table}",
            get(select_rows)
                .post(insert_rows)
                .patch(update_rows)
                .delete(delete_rows),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(rest)
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// The full API over `tables`, without binding a socket.
pub(crate) fn app(
    tables: Arc<Mutex<TableStore>>,
    clock: Arc<dyn Clock>,
    api_key: Option<String>,
) -> Router {
    build_router(AppState {
        tables,
        clock,
        api_key,
    })
}

// --- Server startup ---

pub async fn start_server(
    tables: TableStore,
    clock: Arc<dyn Clock>,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let app = app(Arc::new(Mutex::new(tables)), clock, api_key.clone());

    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {}...{} (see api_key file in data directory)",
            &key[..4],
            &key[key.len() - 4..],
        );
    } else {
        warn!("authentication disabled (--no-auth), API is open to anyone");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        warn!(bind, "listening beyond localhost with no authentication");
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("Failed to bind {bind}:{port}"))?;
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for ctrl-c");
            }
        })
        .await?;

    Ok(())
}
