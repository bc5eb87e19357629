use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Database error: {0}")]
    Database(sea_orm::DbErr),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Backup tool not found for {engine}. Please ensure {tool} is installed and available in PATH")]
    ToolMissing { engine: String, tool: String },

    #[error("Failed to set up SSH tunnel: {0}")]
    TunnelSetupFailed(String),

    #[error("Backup subprocess failed: {0}")]
    SubprocessFailed(String),

    #[error("pg_dump/server version mismatch: {0}")]
    VersionMismatch(String),

    #[error("Storage error: {0}")]
    Storage(#[from] keel_storage::StorageError),

    #[error("Uploaded to {succeeded}/{total} providers, errors: {errors}")]
    UploadPartial {
        succeeded: usize,
        total: usize,
        errors: String,
    },

    #[error("Failed to upload to any S3 provider: {0}")]
    UploadAllFailed(String),

    #[error("Invalid or expired share link")]
    ShareInvalid,

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Backup canceled")]
    Canceled,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sea_orm::DbErr> for BackupError {
    fn from(err: sea_orm::DbErr) -> Self {
        match err {
            sea_orm::DbErr::RecordNotFound(msg) => BackupError::NotFound(msg),
            _ => BackupError::Database(err),
        }
    }
}

impl From<anyhow::Error> for BackupError {
    fn from(err: anyhow::Error) -> Self {
        BackupError::Internal(err.to_string())
    }
}

impl From<keel_core::ServiceError> for BackupError {
    fn from(err: keel_core::ServiceError) -> Self {
        use keel_core::ServiceError;
        match err {
            ServiceError::InvalidCredential { field } => BackupError::InvalidCredential(field),
            ServiceError::ChecksumMismatch { expected, actual } => BackupError::ChecksumMismatch(
                format!("expected {}, got {}", expected, actual),
            ),
            ServiceError::NotFound { resource } => BackupError::NotFound(resource),
            ServiceError::Validation { message } => BackupError::Validation(message),
            other => BackupError::Internal(other.to_string()),
        }
    }
}
