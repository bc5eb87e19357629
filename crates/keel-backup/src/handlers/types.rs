use std::sync::Arc;

use axum::http::StatusCode;
use keel_core::problemdetails::{self, Problem};
use uuid::Uuid;

use crate::services::{
    backup::BackupService, error::BackupError, scheduler::ScheduleManager,
    share::ShareTokenService,
};

/// Authenticated caller, inserted into request extensions by the external
/// auth middleware.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

#[derive(Clone)]
pub struct AppState {
    pub backup_service: Arc<BackupService>,
    pub schedule_manager: Arc<ScheduleManager>,
    pub share_service: Arc<ShareTokenService>,
}

impl From<BackupError> for Problem {
    fn from(error: BackupError) -> Self {
        use keel_storage::StorageError;

        match error {
            BackupError::NotFound(msg) => problemdetails::new(StatusCode::NOT_FOUND)
                .with_title("Resource Not Found")
                .with_detail(msg),

            BackupError::ShareInvalid => problemdetails::new(StatusCode::NOT_FOUND)
                .with_title("Invalid Share Link")
                .with_detail("Invalid or expired link"),

            BackupError::Unauthorized => problemdetails::new(StatusCode::UNAUTHORIZED)
                .with_title("Unauthorized"),

            BackupError::Validation(msg) => problemdetails::new(StatusCode::BAD_REQUEST)
                .with_title("Validation Error")
                .with_detail(msg),

            BackupError::Schedule(msg) => problemdetails::new(StatusCode::BAD_REQUEST)
                .with_title("Schedule Error")
                .with_detail(msg),

            BackupError::InvalidCredential(field) => problemdetails::new(StatusCode::BAD_REQUEST)
                .with_title("Invalid Credential")
                .with_detail(format!("{} is empty after sanitation", field)),

            BackupError::Unsupported(msg) => problemdetails::new(StatusCode::BAD_REQUEST)
                .with_title("Unsupported Operation")
                .with_detail(msg),

            // Probe and credential failures surface as 400 to the
            // settings/test endpoints
            BackupError::Storage(
                err @ (StorageError::AuthFailed(_)
                | StorageError::BucketInaccessible(_)
                | StorageError::BucketMissing(_)
                | StorageError::InvalidCredential { .. }),
            ) => problemdetails::new(StatusCode::BAD_REQUEST)
                .with_title("S3 Storage Error")
                .with_detail(err.to_string()),

            BackupError::Storage(StorageError::NotFound(key)) => {
                problemdetails::new(StatusCode::NOT_FOUND)
                    .with_title("Object Not Found")
                    .with_detail(format!("Object not found: {}", key))
            }

            BackupError::Storage(err) => problemdetails::new(StatusCode::INTERNAL_SERVER_ERROR)
                .with_title("S3 Storage Error")
                .with_detail(err.to_string()),

            BackupError::Database(err) => problemdetails::new(StatusCode::INTERNAL_SERVER_ERROR)
                .with_title("Database Error")
                .with_detail(err.to_string()),

            other => problemdetails::new(StatusCode::INTERNAL_SERVER_ERROR)
                .with_title("Internal Server Error")
                .with_detail(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let problem: Problem = BackupError::NotFound("Backup x not found".to_string()).into();
        assert_eq!(problem.status_code, StatusCode::NOT_FOUND);
        assert_eq!(problem.body["detail"], "Backup x not found");
    }

    #[test]
    fn probe_failures_map_to_400() {
        use keel_storage::StorageError;

        let problem: Problem =
            BackupError::Storage(StorageError::AuthFailed("rejected".to_string())).into();
        assert_eq!(problem.status_code, StatusCode::BAD_REQUEST);

        let problem: Problem = BackupError::Storage(StorageError::InvalidCredential {
            field: "access_key".to_string(),
        })
        .into();
        assert_eq!(problem.status_code, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn pipeline_failures_map_to_500() {
        let problem: Problem = BackupError::SubprocessFailed("exit status 1".to_string()).into();
        assert_eq!(problem.status_code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(problem.body["title"], "Internal Server Error");
    }
}
