//! Time-limited share tokens for unauthenticated backup downloads.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::services::error::BackupError;
use crate::services::repository::BackupRepository;

const DEFAULT_TTL_HOURS: i64 = 24;
const MIN_TTL_HOURS: i64 = 1;
const MAX_TTL_HOURS: i64 = 168;

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ShareLink {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub url: String,
}

pub struct ShareTokenService {
    repo: Arc<BackupRepository>,
}

impl ShareTokenService {
    pub fn new(repo: Arc<BackupRepository>) -> Self {
        Self { repo }
    }

    /// Issues a token bound to (backup, provider). The TTL is clamped to
    /// 1..=168 hours; zero or negative falls back to 24 hours.
    pub async fn create_share(
        &self,
        backup_id: Uuid,
        provider_id: Option<Uuid>,
        ttl_hours: Option<i64>,
    ) -> Result<ShareLink, BackupError> {
        // The backup must exist before a link can point at it
        self.repo.get_backup(backup_id).await?;

        let ttl = match ttl_hours {
            Some(hours) if hours > 0 => hours.clamp(MIN_TTL_HOURS, MAX_TTL_HOURS),
            _ => DEFAULT_TTL_HOURS,
        };

        // Two concatenated v4 uuids rendered as hex: 256 bits of entropy
        let token = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let expires_at = Utc::now() + Duration::hours(ttl);

        self.repo
            .create_shareable_link(backup_id, provider_id, &token, expires_at)
            .await?;

        Ok(ShareLink {
            url: format!("/api/backups/share/{}", token),
            token,
            expires_at,
        })
    }

    /// Validates a token and counts the access. Unknown and expired
    /// tokens are indistinguishable to the caller.
    pub async fn resolve_share(
        &self,
        token: &str,
    ) -> Result<(Uuid, Option<Uuid>), BackupError> {
        self.repo.resolve_shareable_link(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::repository::tests::seed_backup;
    use keel_database::test_utils::TestDatabase;

    async fn service_with_backup() -> (ShareTokenService, Uuid) {
        let test_db = TestDatabase::with_migrations().await.unwrap();
        let db = test_db.connection_arc();
        let backup_id = seed_backup(&db).await;
        let repo = Arc::new(BackupRepository::new(db));
        (ShareTokenService::new(repo), backup_id)
    }

    #[tokio::test]
    async fn token_has_256_bits_of_entropy_as_hex() {
        let (service, backup_id) = service_with_backup().await;
        let link = service.create_share(backup_id, None, None).await.unwrap();

        assert_eq!(link.token.len(), 64);
        assert!(link.token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(link.url, format!("/api/backups/share/{}", link.token));
    }

    #[tokio::test]
    async fn ttl_is_clamped_and_defaulted() {
        let (service, backup_id) = service_with_backup().await;
        let now = Utc::now();

        let default = service.create_share(backup_id, None, None).await.unwrap();
        let hours = (default.expires_at - now).num_hours();
        assert!((23..=24).contains(&hours));

        let clamped = service
            .create_share(backup_id, None, Some(10_000))
            .await
            .unwrap();
        assert!((clamped.expires_at - now).num_hours() <= MAX_TTL_HOURS);

        let negative = service.create_share(backup_id, None, Some(-5)).await.unwrap();
        assert!((23..=24).contains(&(negative.expires_at - now).num_hours()));
    }

    #[tokio::test]
    async fn resolve_round_trip_binds_backup_and_provider() {
        let (service, backup_id) = service_with_backup().await;
        let provider_id = Uuid::new_v4();

        let link = service
            .create_share(backup_id, Some(provider_id), Some(2))
            .await
            .unwrap();

        let (resolved_backup, resolved_provider) =
            service.resolve_share(&link.token).await.unwrap();
        assert_eq!(resolved_backup, backup_id);
        assert_eq!(resolved_provider, Some(provider_id));
    }

    #[tokio::test]
    async fn share_for_unknown_backup_is_rejected() {
        let (service, _) = service_with_backup().await;
        assert!(matches!(
            service.create_share(Uuid::new_v4(), None, None).await,
            Err(BackupError::NotFound(_))
        ));
    }
}
