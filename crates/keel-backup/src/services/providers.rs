//! S3 provider configuration management.
//!
//! Credentials are sanitized on the way in, encrypted at rest, decrypted
//! and sanitized again on use. Read paths blank the secrets before the
//! model leaves the service.

use std::sync::Arc;

use chrono::Utc;
use keel_core::sanitize::{sanitize_credential, sanitize_endpoint};
use keel_core::EncryptionService;
use keel_database::DbConnection;
use keel_entities::s3_providers;
use keel_storage::{ObjectStore, S3Config};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use tracing::debug;
use uuid::Uuid;

use crate::services::error::BackupError;

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct S3ProviderRequest {
    pub name: String,
    /// Endpoint host or URL, e.g. "s3.eu-central-003.backblazeb2.com"
    pub endpoint: String,
    pub region: Option<String>,
    pub bucket: String,
    pub access_key: String,
    /// Empty on update keeps the stored secret
    pub secret_key: String,
    pub use_ssl: Option<bool>,
    pub path_prefix: Option<String>,
    pub is_default: Option<bool>,
}

pub struct S3ProviderService {
    db: Arc<DbConnection>,
    encryption: Arc<EncryptionService>,
}

impl S3ProviderService {
    pub fn new(db: Arc<DbConnection>, encryption: Arc<EncryptionService>) -> Self {
        Self { db, encryption }
    }

    pub async fn create_provider(
        &self,
        user_id: Uuid,
        request: S3ProviderRequest,
    ) -> Result<s3_providers::Model, BackupError> {
        if request.name.trim().is_empty() {
            return Err(BackupError::Validation(
                "provider name cannot be empty".to_string(),
            ));
        }

        let access_key = sanitize_credential(&request.access_key);
        let secret_key = sanitize_credential(&request.secret_key);
        let endpoint = sanitize_endpoint(&request.endpoint);
        let bucket = sanitize_credential(&request.bucket);

        let encrypted_secret = self
            .encryption
            .encrypt_string(&secret_key)
            .map_err(|e| BackupError::Internal(format!("failed to encrypt secret key: {}", e)))?;

        let is_default = request.is_default.unwrap_or(false);

        let txn = self.db.begin().await?;
        if is_default {
            clear_default(&txn, user_id).await?;
        }

        let active = s3_providers::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            name: Set(request.name.trim().to_string()),
            endpoint: Set(endpoint),
            region: Set(request.region.map(|r| r.trim().to_string())),
            bucket: Set(bucket),
            access_key: Set(access_key),
            secret_key: Set(encrypted_secret),
            use_ssl: Set(request.use_ssl.unwrap_or(true)),
            path_prefix: Set(request.path_prefix.map(|p| p.trim().to_string())),
            is_default: Set(is_default),
            ..Default::default()
        };
        let mut provider = active.insert(&txn).await?;
        txn.commit().await?;

        debug!("created S3 provider {}", provider.name);
        blank_secrets(&mut provider);
        Ok(provider)
    }

    pub async fn update_provider(
        &self,
        id: Uuid,
        user_id: Uuid,
        request: S3ProviderRequest,
    ) -> Result<s3_providers::Model, BackupError> {
        let existing = self.find_owned(id, user_id).await?;
        let was_default = existing.is_default;

        let txn = self.db.begin().await?;

        let make_default = request.is_default.unwrap_or(was_default);
        if make_default && !was_default {
            clear_default(&txn, user_id).await?;
        }

        let mut active: s3_providers::ActiveModel = existing.into();
        active.name = Set(request.name.trim().to_string());
        active.endpoint = Set(sanitize_endpoint(&request.endpoint));
        active.bucket = Set(sanitize_credential(&request.bucket));
        active.access_key = Set(sanitize_credential(&request.access_key));
        active.region = Set(request.region.map(|r| r.trim().to_string()));
        active.path_prefix = Set(request.path_prefix.map(|p| p.trim().to_string()));
        if let Some(use_ssl) = request.use_ssl {
            active.use_ssl = Set(use_ssl);
        }
        active.is_default = Set(make_default);

        // Empty secret keeps the stored one
        if !request.secret_key.is_empty() {
            let secret = sanitize_credential(&request.secret_key);
            let encrypted = self.encryption.encrypt_string(&secret).map_err(|e| {
                BackupError::Internal(format!("failed to encrypt secret key: {}", e))
            })?;
            active.secret_key = Set(encrypted);
        }

        let mut provider = active.update(&txn).await?;
        txn.commit().await?;

        blank_secrets(&mut provider);
        Ok(provider)
    }

    pub async fn list_providers(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<s3_providers::Model>, BackupError> {
        let mut providers = s3_providers::Entity::find()
            .filter(s3_providers::Column::UserId.eq(user_id))
            .order_by_desc(s3_providers::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        for provider in &mut providers {
            blank_secrets(provider);
        }
        Ok(providers)
    }

    pub async fn get_provider(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<s3_providers::Model, BackupError> {
        let mut provider = self.find_owned(id, user_id).await?;
        blank_secrets(&mut provider);
        Ok(provider)
    }

    pub async fn delete_provider(&self, id: Uuid, user_id: Uuid) -> Result<(), BackupError> {
        self.find_owned(id, user_id).await?;
        s3_providers::Entity::delete_by_id(id)
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    pub async fn set_default_provider(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<(), BackupError> {
        let provider = self.find_owned(id, user_id).await?;

        let txn = self.db.begin().await?;
        clear_default(&txn, user_id).await?;
        let mut active: s3_providers::ActiveModel = provider.into();
        active.is_default = Set(true);
        active.update(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn get_default_provider(
        &self,
        user_id: Uuid,
    ) -> Result<Option<s3_providers::Model>, BackupError> {
        let mut provider = s3_providers::Entity::find()
            .filter(s3_providers::Column::UserId.eq(user_id))
            .filter(s3_providers::Column::IsDefault.eq(true))
            .one(self.db.as_ref())
            .await?;
        if let Some(provider) = &mut provider {
            blank_secrets(provider);
        }
        Ok(provider)
    }

    /// Provider with decrypted, re-sanitized credentials for an upload or
    /// download. Never exposed over HTTP.
    pub async fn provider_for_upload(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<s3_providers::Model, BackupError> {
        let mut provider = self.find_owned(id, user_id).await?;

        let secret = self
            .encryption
            .decrypt_string(&provider.secret_key)
            .map_err(|e| BackupError::Internal(format!("failed to decrypt secret key: {}", e)))?;

        // Sanitize again after decryption: the stored value may predate
        // sanitation at the write boundary.
        provider.access_key = sanitize_credential(&provider.access_key);
        provider.secret_key = sanitize_credential(&secret);
        provider.endpoint = sanitize_endpoint(&provider.endpoint);
        provider.bucket = sanitize_credential(&provider.bucket);

        Ok(provider)
    }

    /// Every provider of the user, decrypted for upload, default first.
    pub async fn all_providers_for_upload(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<s3_providers::Model>, BackupError> {
        let rows = s3_providers::Entity::find()
            .filter(s3_providers::Column::UserId.eq(user_id))
            .order_by_desc(s3_providers::Column::IsDefault)
            .order_by_asc(s3_providers::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;

        let mut providers = Vec::with_capacity(rows.len());
        for row in rows {
            providers.push(self.provider_for_upload(row.id, user_id).await?);
        }
        Ok(providers)
    }

    /// Probes the provider configuration against the object store.
    pub async fn test_provider(&self, id: Uuid, user_id: Uuid) -> Result<(), BackupError> {
        let provider = self.provider_for_upload(id, user_id).await?;
        let store = ObjectStore::connect(to_s3_config(&provider)).await?;
        store.test_connection().await?;
        Ok(())
    }

    async fn find_owned(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<s3_providers::Model, BackupError> {
        s3_providers::Entity::find_by_id(id)
            .filter(s3_providers::Column::UserId.eq(user_id))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("S3 provider {} not found", id)))
    }
}

/// Storage client configuration from a decrypted provider row.
pub fn to_s3_config(provider: &s3_providers::Model) -> S3Config {
    S3Config {
        endpoint: provider.endpoint.clone(),
        region: provider.region.clone(),
        bucket: provider.bucket.clone(),
        access_key: provider.access_key.clone(),
        secret_key: provider.secret_key.clone(),
        use_ssl: provider.use_ssl,
        path_prefix: provider.path_prefix.clone(),
    }
}

fn blank_secrets(provider: &mut s3_providers::Model) {
    provider.access_key = String::new();
    provider.secret_key = String::new();
}

async fn clear_default<C: sea_orm::ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<(), BackupError> {
    use sea_orm::sea_query::Expr;

    s3_providers::Entity::update_many()
        .col_expr(s3_providers::Column::IsDefault, Expr::value(false))
        .filter(s3_providers::Column::UserId.eq(user_id))
        .exec(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_database::test_utils::TestDatabase;
    use sea_orm::PaginatorTrait;

    fn request(name: &str, is_default: bool) -> S3ProviderRequest {
        S3ProviderRequest {
            name: name.to_string(),
            endpoint: " s3.example.com ".to_string(),
            region: Some(" eu-central-1 ".to_string()),
            bucket: " back\u{200b}ups ".to_string(),
            access_key: " AKIA XYZ ".to_string(),
            secret_key: " se cret ".to_string(),
            use_ssl: Some(true),
            path_prefix: Some("prod/".to_string()),
            is_default: Some(is_default),
        }
    }

    async fn service() -> (S3ProviderService, Arc<DbConnection>) {
        let test_db = TestDatabase::with_migrations().await.unwrap();
        let db = test_db.connection_arc();
        let encryption = Arc::new(EncryptionService::new_from_password("test-master-key"));
        (S3ProviderService::new(db.clone(), encryption), db)
    }

    #[tokio::test]
    async fn create_sanitizes_and_encrypts() {
        let (service, db) = service().await;
        let user = Uuid::new_v4();

        let created = service.create_provider(user, request("aws", false)).await.unwrap();
        assert_eq!(created.endpoint, "s3.example.com");
        // Secrets are blanked on the way out
        assert!(created.access_key.is_empty());
        assert!(created.secret_key.is_empty());

        let stored = s3_providers::Entity::find_by_id(created.id)
            .one(db.as_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.access_key, "AKIAXYZ");
        assert_eq!(stored.bucket, "backups");
        // Stored secret is ciphertext
        assert_ne!(stored.secret_key, "secret");

        let decrypted = service.provider_for_upload(created.id, user).await.unwrap();
        assert_eq!(decrypted.secret_key, "secret");
        assert_eq!(decrypted.access_key, "AKIAXYZ");
    }

    #[tokio::test]
    async fn at_most_one_default_per_user() {
        let (service, db) = service().await;
        let user = Uuid::new_v4();

        let first = service.create_provider(user, request("first", true)).await.unwrap();
        let second = service.create_provider(user, request("second", true)).await.unwrap();

        let defaults = s3_providers::Entity::find()
            .filter(s3_providers::Column::UserId.eq(user))
            .filter(s3_providers::Column::IsDefault.eq(true))
            .count(db.as_ref())
            .await
            .unwrap();
        assert_eq!(defaults, 1);

        let current = service.get_default_provider(user).await.unwrap().unwrap();
        assert_eq!(current.id, second.id);

        service.set_default_provider(first.id, user).await.unwrap();
        let current = service.get_default_provider(user).await.unwrap().unwrap();
        assert_eq!(current.id, first.id);

        let defaults = s3_providers::Entity::find()
            .filter(s3_providers::Column::UserId.eq(user))
            .filter(s3_providers::Column::IsDefault.eq(true))
            .count(db.as_ref())
            .await
            .unwrap();
        assert_eq!(defaults, 1);
    }

    #[tokio::test]
    async fn update_with_empty_secret_keeps_stored_one() {
        let (service, _db) = service().await;
        let user = Uuid::new_v4();

        let created = service.create_provider(user, request("keep", false)).await.unwrap();

        let mut update = request("keep-renamed", false);
        update.secret_key = String::new();
        service.update_provider(created.id, user, update).await.unwrap();

        let decrypted = service.provider_for_upload(created.id, user).await.unwrap();
        assert_eq!(decrypted.secret_key, "secret");
    }

    #[tokio::test]
    async fn providers_are_scoped_to_their_owner() {
        let (service, _db) = service().await;
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        let created = service.create_provider(owner, request("mine", false)).await.unwrap();
        assert!(matches!(
            service.get_provider(created.id, stranger).await,
            Err(BackupError::NotFound(_))
        ));
        assert!(service.get_provider(created.id, owner).await.is_ok());
    }

    #[tokio::test]
    async fn all_providers_for_upload_orders_default_first() {
        let (service, _db) = service().await;
        let user = Uuid::new_v4();

        service.create_provider(user, request("plain", false)).await.unwrap();
        let default = service.create_provider(user, request("chosen", true)).await.unwrap();

        let providers = service.all_providers_for_upload(user).await.unwrap();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].id, default.id);
        // Decrypted for upload
        assert_eq!(providers[0].secret_key, "secret");
    }
}
