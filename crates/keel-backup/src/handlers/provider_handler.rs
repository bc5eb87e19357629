use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use keel_core::problemdetails::{Problem, ProblemDetails};
use keel_entities::s3_providers;

use crate::handlers::types::{AppState, AuthUser};
use crate::services::providers::S3ProviderRequest;

#[derive(OpenApi)]
#[openapi(
    paths(
        list_providers,
        create_provider,
        get_provider,
        update_provider,
        delete_provider,
        test_provider,
    ),
    components(schemas(S3ProviderRequest, S3ProviderResponse, ProblemDetails)),
    info(
        title = "S3 Providers API",
        description = "Object store provider configuration.",
        version = "1.0.0"
    ),
    tags((name = "S3 Providers", description = "Provider management endpoints"))
)]
pub struct ProviderApiDoc;

/// Provider shape returned to the UI. Credentials never leave the server.
#[derive(Serialize, ToSchema)]
pub struct S3ProviderResponse {
    pub id: Uuid,
    pub name: String,
    pub endpoint: String,
    pub region: Option<String>,
    pub bucket: String,
    pub use_ssl: bool,
    pub path_prefix: Option<String>,
    pub is_default: bool,
    #[schema(example = "2025-01-02T03:04:05Z")]
    pub created_at: String,
}

impl From<s3_providers::Model> for S3ProviderResponse {
    fn from(model: s3_providers::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            endpoint: model.endpoint,
            region: model.region,
            bucket: model.bucket,
            use_ssl: model.use_ssl,
            path_prefix: model.path_prefix,
            is_default: model.is_default,
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

pub fn configure_routes() -> Router<AppState> {
    Router::new()
        .route("/s3-providers", get(list_providers).post(create_provider))
        .route(
            "/s3-providers/{id}",
            get(get_provider)
                .put(update_provider)
                .delete(delete_provider),
        )
        .route("/s3-providers/{id}/test", post(test_provider))
}

#[utoipa::path(
    get,
    path = "/api/s3-providers",
    responses(
        (status = 200, description = "All providers of the caller"),
        (status = 500, description = "Internal error", body = ProblemDetails)
    ),
    tag = "S3 Providers"
)]
async fn list_providers(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<S3ProviderResponse>>, Problem> {
    let providers = state
        .backup_service
        .provider_service()
        .list_providers(user.0)
        .await?;
    Ok(Json(providers.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    post,
    path = "/api/s3-providers",
    request_body = S3ProviderRequest,
    responses(
        (status = 200, description = "Provider created", body = S3ProviderResponse),
        (status = 400, description = "Invalid provider configuration", body = ProblemDetails)
    ),
    tag = "S3 Providers"
)]
async fn create_provider(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<S3ProviderRequest>,
) -> Result<Json<S3ProviderResponse>, Problem> {
    let provider = state
        .backup_service
        .provider_service()
        .create_provider(user.0, request)
        .await?;
    Ok(Json(provider.into()))
}

#[utoipa::path(
    get,
    path = "/api/s3-providers/{id}",
    params(("id" = Uuid, Path, description = "Provider id")),
    responses(
        (status = 200, description = "Provider", body = S3ProviderResponse),
        (status = 404, description = "Not found", body = ProblemDetails)
    ),
    tag = "S3 Providers"
)]
async fn get_provider(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<S3ProviderResponse>, Problem> {
    let provider = state
        .backup_service
        .provider_service()
        .get_provider(id, user.0)
        .await?;
    Ok(Json(provider.into()))
}

#[utoipa::path(
    put,
    path = "/api/s3-providers/{id}",
    params(("id" = Uuid, Path, description = "Provider id")),
    request_body = S3ProviderRequest,
    responses(
        (status = 200, description = "Provider updated", body = S3ProviderResponse),
        (status = 404, description = "Not found", body = ProblemDetails)
    ),
    tag = "S3 Providers"
)]
async fn update_provider(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<S3ProviderRequest>,
) -> Result<Json<S3ProviderResponse>, Problem> {
    let provider = state
        .backup_service
        .provider_service()
        .update_provider(id, user.0, request)
        .await?;
    Ok(Json(provider.into()))
}

#[utoipa::path(
    delete,
    path = "/api/s3-providers/{id}",
    params(("id" = Uuid, Path, description = "Provider id")),
    responses(
        (status = 200, description = "Provider deleted"),
        (status = 404, description = "Not found", body = ProblemDetails)
    ),
    tag = "S3 Providers"
)]
async fn delete_provider(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Problem> {
    state
        .backup_service
        .provider_service()
        .delete_provider(id, user.0)
        .await?;
    Ok(StatusCode::OK)
}

/// Probes the stored configuration against the object store.
#[utoipa::path(
    post,
    path = "/api/s3-providers/{id}/test",
    params(("id" = Uuid, Path, description = "Provider id")),
    responses(
        (status = 200, description = "Provider reachable"),
        (status = 400, description = "Credentials rejected or bucket inaccessible", body = ProblemDetails)
    ),
    tag = "S3 Providers"
)]
async fn test_provider(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Problem> {
    state
        .backup_service
        .provider_service()
        .test_provider(id, user.0)
        .await?;
    Ok(StatusCode::OK)
}
