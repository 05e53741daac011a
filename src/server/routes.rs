//! 路由和处理器

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::AppState;
use crate::error::Error;
use crate::feed::{ChangeSource, WorkspaceSource};
use crate::protocol::{ChangeQuery, ChangeRecord, Event, GenerationRequest};
use crate::store::GalleryStore;

/// 构建路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/events", get(live_events))
        .route("/api/generate", post(generate))
        .route("/api/changes", get(list_changes))
        .route("/api/tables", get(list_tables).post(create_table))
        .route("/api/tables/:id/images", post(record_image))
        .route("/api/tables/:id/lock", post(lock_table))
        .route("/api/status", get(status))
        .with_state(state)
}

/// 实时更新流：第一帧总是 connected
async fn live_events(State(state): State<AppState>) -> Result<Response, ApiError> {
    let (tx, rx) = mpsc::channel::<String>(state.channel_capacity);
    let watch = tx.clone();
    let conn_id = state.registry.connect(tx)?;
    tracing::debug!("📥 新连接: conn_id={}", conn_id);

    // 客户端断开后立即清理，不必等下一次广播
    let registry = state.registry.clone();
    tokio::spawn(async move {
        watch.closed().await;
        registry.unregister(conn_id);
        tracing::debug!("📤 连接关闭: conn_id={}", conn_id);
    });

    let stream = ReceiverStream::new(rx)
        .map(Ok::<_, Infallible>)
        .take_until(state.shutdown.clone().cancelled_owned());

    Ok(event_stream_response(Body::from_stream(stream)))
}

/// 生成中继流；校验失败直接 400，不打开流
async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Response, ApiError> {
    let rx = state.relay.open(request)?;

    let stream = ReceiverStream::new(rx)
        .map(|event| event.to_frame())
        .take_until(state.shutdown.clone().cancelled_owned());

    Ok(event_stream_response(Body::from_stream(stream)))
}

fn event_stream_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct ChangesParams {
    #[serde(default)]
    since: i64,
    scope: Option<String>,
    limit: Option<usize>,
}

async fn list_changes(
    State(state): State<AppState>,
    Query(params): Query<ChangesParams>,
) -> Result<Json<Vec<ChangeRecord>>, ApiError> {
    let query = ChangeQuery::new(params.since)
        .with_scope(params.scope.filter(|s| !s.is_empty()))
        .with_limit(params.limit.unwrap_or(ChangeQuery::DEFAULT_LIMIT));

    let changes = ChangeSource::changes_since(&state.store, query).await?;
    Ok(Json(changes))
}

async fn list_tables(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let tables = WorkspaceSource::list_workspaces(&state.store).await?;
    Ok(Json(tables))
}

#[derive(Debug, Deserialize)]
struct CreateTableBody {
    name: String,
}

async fn create_table(
    State(state): State<AppState>,
    Json(body): Json<CreateTableBody>,
) -> Result<impl IntoResponse, ApiError> {
    let table = blocking(&state.store, move |store| store.create_table(&body.name)).await?;
    Ok((StatusCode::CREATED, Json(table)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordImageBody {
    persona_id: String,
    #[serde(default)]
    prompt: String,
    url: String,
}

async fn record_image(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    Json(body): Json<RecordImageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let record = blocking(&state.store, move |store| {
        store.record_image(&table_id, &body.persona_id, &body.prompt, &body.url)
    })
    .await?;

    let delivered = state.registry.broadcast(&Event::data_change(&record)?);
    tracing::debug!("📢 image recorded: table={} delivered={}", record.table_id, delivered);

    Ok((StatusCode::CREATED, Json(record)))
}

async fn lock_table(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
) -> Result<Json<ChangeRecord>, ApiError> {
    let record = blocking(&state.store, move |store| store.lock_table(&table_id)).await?;

    let delivered = state.registry.broadcast(&Event::data_change(&record)?);
    tracing::debug!("📢 table locked: table={} delivered={}", record.table_id, delivered);

    Ok(Json(record))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "version": crate::VERSION_FULL,
        "connections": state.registry.connection_count(),
    }))
}

/// 在阻塞线程池中执行存储操作
async fn blocking<T, F>(store: &GalleryStore, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&GalleryStore) -> crate::Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| ApiError(Error::Other(e.into())))?
        .map_err(ApiError)
}

/// HTTP 错误响应：Validation → 400，NotFound → 404，其余 500
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!("请求处理失败: {}", self.0);
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
