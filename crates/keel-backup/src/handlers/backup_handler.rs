use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use keel_core::problemdetails::{self, Problem, ProblemDetails};
use keel_entities::backups;

use crate::handlers::provider_handler;
use crate::handlers::types::{AppState, AuthUser};
use crate::services::repository::{BackupListItem, BackupListOptions};
use crate::services::share::ShareLink;

/// How long the SSE endpoint waits for a log channel to appear.
const STREAM_ATTACH_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_ATTACH_POLL: Duration = Duration::from_millis(500);

#[derive(OpenApi)]
#[openapi(
    paths(
        create_backup,
        list_backups,
        get_active_backups,
        get_backup,
        cancel_backup,
        get_stored_logs,
        stream_backup_logs,
        download_backup,
        create_share,
        download_shared,
        schedule_backup,
        update_schedule,
        disable_schedule,
        restore_backup,
    ),
    components(schemas(
        CreateBackupRequest,
        ScheduleBackupRequest,
        UpdateScheduleRequest,
        RestoreRequest,
        CreateShareRequest,
        BackupResponse,
        ShareLink,
        ProblemDetails,
    )),
    info(
        title = "Backups API",
        description = "Backup execution, log streaming, schedules and share links.",
        version = "1.0.0"
    ),
    tags((name = "Backups", description = "Backup management endpoints"))
)]
pub struct BackupApiDoc;

#[derive(Deserialize, ToSchema)]
pub struct CreateBackupRequest {
    pub connection_id: Uuid,
    /// Explicit sink selection; omitted means every provider of the owner
    pub s3_provider_ids: Option<Vec<Uuid>>,
}

#[derive(Deserialize, ToSchema)]
pub struct ScheduleBackupRequest {
    pub connection_id: Uuid,
    /// Six-field cron expression, seconds first
    #[schema(example = "0 0 3 * * *")]
    pub cron_schedule: String,
    pub retention_days: i32,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateScheduleRequest {
    #[schema(example = "0 30 2 * * *")]
    pub cron_schedule: String,
    pub retention_days: i32,
}

#[derive(Deserialize, ToSchema)]
pub struct RestoreRequest {
    pub backup_id: Uuid,
    pub connection_id: Uuid,
    /// Skip SHA-256 verification before restoring
    #[serde(default)]
    pub skip_checksum: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateShareRequest {
    pub provider_id: Option<Uuid>,
    /// Hours until expiration, clamped to 1..=168
    pub expires_in: Option<i64>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    pub search: Option<String>,
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub provider_id: Option<Uuid>,
}

#[derive(Serialize, ToSchema)]
pub struct BackupResponse {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub status: String,
    pub path: String,
    pub s3_object_key: Option<String>,
    pub s3_provider_id: Option<Uuid>,
    pub size: i64,
    pub md5_hash: Option<String>,
    pub sha256_hash: Option<String>,
    #[schema(example = "2025-01-02T03:04:05Z")]
    pub started_time: String,
    pub completed_time: Option<String>,
}

impl From<backups::Model> for BackupResponse {
    fn from(model: backups::Model) -> Self {
        Self {
            id: model.id,
            connection_id: model.connection_id,
            schedule_id: model.schedule_id,
            status: model.status,
            path: model.path,
            s3_object_key: model.s3_object_key,
            s3_provider_id: model.s3_provider_id,
            size: model.size,
            md5_hash: model.md5_hash,
            sha256_hash: model.sha256_hash,
            started_time: model.started_time.to_rfc3339(),
            completed_time: model.completed_time.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
pub struct BackupListEntry {
    #[serde(flatten)]
    pub backup: BackupResponse,
    pub database_name: String,
    pub engine: String,
}

impl From<BackupListItem> for BackupListEntry {
    fn from(item: BackupListItem) -> Self {
        Self {
            backup: item.backup.into(),
            database_name: item.database_name,
            engine: item.engine,
        }
    }
}

pub fn configure_routes(state: AppState) -> Router {
    Router::new()
        .route("/backups", post(create_backup).get(list_backups))
        .route("/backups/active", get(get_active_backups))
        .route("/backups/schedule", post(schedule_backup))
        .route("/backups/restore", post(restore_backup))
        .route("/backups/share/{token}", get(download_shared))
        .route("/backups/{id}", get(get_backup))
        .route("/backups/{id}/cancel", post(cancel_backup))
        .route("/backups/{id}/logs/stored", get(get_stored_logs))
        .route("/backups/{id}/logs", get(stream_backup_logs))
        .route("/backups/{id}/download", get(download_backup))
        .route("/backups/{id}/share", post(create_share))
        .route("/backups/{connection_id}/schedule", put(update_schedule))
        .route(
            "/backups/{connection_id}/schedule/disable",
            post(disable_schedule),
        )
        .merge(provider_handler::configure_routes())
        .with_state(state)
}

/// Start a backup. Returns immediately with the in_progress record; the
/// pipeline runs asynchronously.
#[utoipa::path(
    post,
    path = "/api/backups",
    request_body = CreateBackupRequest,
    responses(
        (status = 200, description = "Backup started", body = BackupResponse),
        (status = 404, description = "Connection not found", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn create_backup(
    State(state): State<AppState>,
    Json(request): Json<CreateBackupRequest>,
) -> Result<Json<BackupResponse>, Problem> {
    let backup = state
        .backup_service
        .clone()
        .start_backup(
            request.connection_id,
            request.s3_provider_ids.unwrap_or_default(),
            None,
        )
        .await?;
    Ok(Json(backup.into()))
}

#[utoipa::path(
    get,
    path = "/api/backups",
    params(
        ("page" = Option<u64>, Query, description = "1-based page"),
        ("limit" = Option<u64>, Query, description = "page size, max 100"),
        ("search" = Option<String>, Query, description = "filter on path or status")
    ),
    responses(
        (status = 200, description = "Paginated backups"),
        (status = 500, description = "Internal error", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn list_backups(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, Problem> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(10).clamp(1, 100);

    let (items, total) = state
        .backup_service
        .repo()
        .list_backups(BackupListOptions {
            user_id: user.0,
            limit,
            offset: (page - 1) * limit,
            search: query.search.unwrap_or_default(),
        })
        .await?;

    let data: Vec<BackupListEntry> = items.into_iter().map(Into::into).collect();
    Ok(Json(serde_json::json!({
        "data": data,
        "page": page,
        "limit": limit,
        "total": total,
    })))
}

#[utoipa::path(
    get,
    path = "/api/backups/active",
    responses(
        (status = 200, description = "All in_progress backups for the caller"),
        (status = 500, description = "Internal error", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn get_active_backups(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<BackupListEntry>>, Problem> {
    let items = state.backup_service.repo().get_active_backups(user.0).await?;
    Ok(Json(items.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    get,
    path = "/api/backups/{id}",
    params(("id" = Uuid, Path, description = "Backup id")),
    responses(
        (status = 200, description = "Backup", body = BackupResponse),
        (status = 404, description = "Not found", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn get_backup(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackupResponse>, Problem> {
    let backup = state.backup_service.repo().get_backup(id).await?;
    Ok(Json(backup.into()))
}

/// Cancel a running backup.
///
/// Terminates the dump subprocess (SIGTERM, then SIGKILL after a grace
/// period); the run ends as failed with a canceled reason.
#[utoipa::path(
    post,
    path = "/api/backups/{id}/cancel",
    params(("id" = Uuid, Path, description = "Backup id")),
    responses(
        (status = 200, description = "Cancellation requested"),
        (status = 404, description = "No active run for this backup", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn cancel_backup(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Problem> {
    state.backup_service.cancel_backup(id)?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    get,
    path = "/api/backups/{id}/logs/stored",
    params(("id" = Uuid, Path, description = "Backup id")),
    responses(
        (status = 200, description = "Durable log text"),
        (status = 500, description = "Internal error", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn get_stored_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, Problem> {
    let logs = state.backup_service.repo().get_backup_logs(id).await?;
    Ok(Json(serde_json::json!({ "logs": logs })))
}

/// Live log stream as Server-Sent Events.
///
/// When the channel does not exist yet the endpoint waits up to 30
/// seconds for the run to start. Every line is one `data:` frame; the
/// stream ends with a `[STREAM ENDED]` sentinel.
#[utoipa::path(
    get,
    path = "/api/backups/{id}/logs",
    params(("id" = Uuid, Path, description = "Backup id")),
    responses((status = 200, description = "SSE stream of log lines")),
    tag = "Backups"
)]
async fn stream_backup_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let bus = state.backup_service.log_bus().clone();

    let stream = async_stream::stream! {
        let mut receiver = bus.subscribe(id);

        if receiver.is_none() {
            yield Ok(Event::default().data("Waiting for backup to start..."));

            let mut waited = Duration::ZERO;
            while waited < STREAM_ATTACH_TIMEOUT {
                tokio::time::sleep(STREAM_ATTACH_POLL).await;
                waited += STREAM_ATTACH_POLL;
                receiver = bus.subscribe(id);
                if receiver.is_some() {
                    break;
                }
            }
        }

        let Some(mut receiver) = receiver else {
            yield Ok(Event::default().data("Backup not found or already completed"));
            return;
        };

        while let Some(line) = receiver.recv().await {
            yield Ok(Event::default().data(line));
        }

        yield Ok(Event::default().data("[STREAM ENDED]"));
    };

    Sse::new(stream)
}

#[utoipa::path(
    get,
    path = "/api/backups/{id}/download",
    params(
        ("id" = Uuid, Path, description = "Backup id"),
        ("provider_id" = Option<Uuid>, Query, description = "Download from a specific binding")
    ),
    responses(
        (status = 200, description = "Backup body as attachment"),
        (status = 404, description = "No stored object", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn download_backup(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, Problem> {
    let (filename, reader) = state
        .backup_service
        .open_download(id, query.provider_id)
        .await?;
    Ok(attachment_response(&filename, reader))
}

#[utoipa::path(
    post,
    path = "/api/backups/{id}/share",
    params(("id" = Uuid, Path, description = "Backup id")),
    request_body = CreateShareRequest,
    responses(
        (status = 200, description = "Share link", body = ShareLink),
        (status = 404, description = "Backup not found", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn create_share(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CreateShareRequest>,
) -> Result<Json<ShareLink>, Problem> {
    let link = state
        .share_service
        .create_share(id, request.provider_id, request.expires_in)
        .await?;
    Ok(Json(link))
}

/// Unauthenticated download through a share token.
#[utoipa::path(
    get,
    path = "/api/backups/share/{token}",
    params(("token" = String, Path, description = "Share token")),
    responses(
        (status = 200, description = "Backup body as attachment"),
        (status = 404, description = "Invalid or expired link", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn download_shared(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, Problem> {
    let (backup_id, provider_id) = state.share_service.resolve_share(&token).await?;
    let (filename, reader) = state
        .backup_service
        .open_download(backup_id, provider_id)
        .await?;
    Ok(attachment_response(&filename, reader))
}

#[utoipa::path(
    post,
    path = "/api/backups/schedule",
    request_body = ScheduleBackupRequest,
    responses(
        (status = 200, description = "Schedule registered"),
        (status = 400, description = "Invalid cron expression or retention", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn schedule_backup(
    State(state): State<AppState>,
    Json(request): Json<ScheduleBackupRequest>,
) -> Result<StatusCode, Problem> {
    if request.cron_schedule.is_empty() {
        return Err(problemdetails::new(StatusCode::BAD_REQUEST)
            .with_title("Validation Error")
            .with_detail("cron_schedule is required"));
    }
    state
        .schedule_manager
        .schedule_backup(
            request.connection_id,
            &request.cron_schedule,
            request.retention_days,
        )
        .await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    put,
    path = "/api/backups/{connection_id}/schedule",
    params(("connection_id" = Uuid, Path, description = "Connection id")),
    request_body = UpdateScheduleRequest,
    responses(
        (status = 200, description = "Schedule updated"),
        (status = 404, description = "No active schedule", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn update_schedule(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
    Json(request): Json<UpdateScheduleRequest>,
) -> Result<StatusCode, Problem> {
    if request.cron_schedule.is_empty() {
        return Err(problemdetails::new(StatusCode::BAD_REQUEST)
            .with_title("Validation Error")
            .with_detail("cron_schedule is required"));
    }
    state
        .schedule_manager
        .update_schedule(connection_id, &request.cron_schedule, request.retention_days)
        .await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    post,
    path = "/api/backups/{connection_id}/schedule/disable",
    params(("connection_id" = Uuid, Path, description = "Connection id")),
    responses(
        (status = 200, description = "Schedule disabled"),
        (status = 404, description = "No active schedule", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn disable_schedule(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
) -> Result<StatusCode, Problem> {
    state.schedule_manager.disable_schedule(connection_id).await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    post,
    path = "/api/backups/restore",
    request_body = RestoreRequest,
    responses(
        (status = 200, description = "Backup restored"),
        (status = 404, description = "Backup or connection not found", body = ProblemDetails)
    ),
    tag = "Backups"
)]
async fn restore_backup(
    State(state): State<AppState>,
    Json(request): Json<RestoreRequest>,
) -> Result<StatusCode, Problem> {
    state
        .backup_service
        .restore_backup(request.backup_id, request.connection_id, request.skip_checksum)
        .await?;
    Ok(StatusCode::OK)
}

fn attachment_response(
    filename: &str,
    reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
) -> Response {
    let stream = ReaderStream::new(reader);
    let mut response = Body::from_stream(stream).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) =
        header::HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
    {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    response
}
