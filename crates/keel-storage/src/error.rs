use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid credential: {field} is empty after sanitation")]
    InvalidCredential { field: String },

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Bucket access denied: {0}")]
    BucketInaccessible(String),

    #[error("Bucket unavailable: {0}")]
    BucketMissing(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<keel_core::ServiceError> for StorageError {
    fn from(err: keel_core::ServiceError) -> Self {
        match err {
            keel_core::ServiceError::InvalidCredential { field } => {
                StorageError::InvalidCredential { field }
            }
            other => StorageError::Upload(other.to_string()),
        }
    }
}
