use std::io::Write;
use std::path::Path;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::{Client as S3Client, Config};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info};

use keel_core::sanitize::{require_credential, sanitize_endpoint};

use crate::error::StorageError;

/// Part size for multipart uploads.
pub const MULTIPART_PART_SIZE: usize = 5 * 1024 * 1024;

/// Files above this size are uploaded via multipart.
pub const MULTIPART_THRESHOLD: u64 = 30 * 1024 * 1024;

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Progress callback invoked with human-readable upload log lines.
pub type LogFn<'a> = &'a (dyn Fn(String) + Send + Sync);

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: Option<String>,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub use_ssl: bool,
    pub path_prefix: Option<String>,
}

/// Handle for one provider configuration.
#[derive(Debug)]
pub struct ObjectStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl ObjectStore {
    /// Builds a client, sanitizes the configuration and proves access.
    ///
    /// Backblaze application keys frequently lack ListBuckets, so for
    /// `backblazeb2.com` endpoints the bucket probe is replaced by a 1-key
    /// object listing. Other endpoints get a head-bucket probe with bucket
    /// creation when absent.
    pub async fn connect(config: S3Config) -> Result<Self, StorageError> {
        let access_key = require_credential("access_key", &config.access_key)?;
        let secret_key = require_credential("secret_key", &config.secret_key)?;
        let bucket = require_credential("bucket", &config.bucket)?;
        let endpoint = sanitize_endpoint(&config.endpoint);
        if endpoint.is_empty() {
            return Err(StorageError::InvalidCredential {
                field: "endpoint".to_string(),
            });
        }

        let region = config
            .region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REGION)
            .to_string();

        let endpoint_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.clone()
        } else if config.use_ssl {
            format!("https://{}", endpoint)
        } else {
            format!("http://{}", endpoint)
        };

        let creds = Credentials::new(access_key, secret_key, None, None, "keel-backup");
        let s3_config = Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .credentials_provider(creds)
            .build();

        let client = S3Client::from_conf(s3_config);

        let store = Self {
            client,
            bucket,
            prefix: config
                .path_prefix
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
        };

        if endpoint.contains("backblazeb2.com") {
            store.probe_by_listing().await?;
        } else {
            store.probe_bucket(&region).await?;
        }

        Ok(store)
    }

    async fn probe_by_listing(&self) -> Result<(), StorageError> {
        debug!(bucket = %self.bucket, "probing bucket access via 1-key listing");
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| classify_probe_error(e.code(), e.to_string()))?;
        Ok(())
    }

    async fn probe_bucket(&self, region: &str) -> Result<(), StorageError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    info!(bucket = %self.bucket, "bucket does not exist, creating it");
                    let mut request = self.client.create_bucket().bucket(&self.bucket);
                    if region != DEFAULT_REGION {
                        use aws_sdk_s3::types::{
                            BucketLocationConstraint, CreateBucketConfiguration,
                        };
                        request = request.create_bucket_configuration(
                            CreateBucketConfiguration::builder()
                                .location_constraint(BucketLocationConstraint::from(region))
                                .build(),
                        );
                    }
                    request
                        .send()
                        .await
                        .map_err(|e| StorageError::BucketMissing(e.to_string()))?;
                    Ok(())
                } else {
                    Err(classify_probe_error(err.code(), err.to_string()))
                }
            }
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Applies the configured path prefix to an object name.
    pub fn object_key(&self, file_name: &str) -> String {
        derive_object_key(&self.prefix, file_name)
    }

    /// Object key for a file inside a per-connection folder.
    pub fn folder_object_key(&self, folder: &str, file_name: &str) -> String {
        if folder.is_empty() {
            self.object_key(file_name)
        } else {
            let nested = format!(
                "{}/{}",
                folder.trim_end_matches('/'),
                file_name.trim_start_matches('/')
            );
            self.object_key(&nested)
        }
    }

    /// Uploads a local file, choosing single-shot or multipart by size.
    /// Returns the final object key.
    pub async fn put_file(
        &self,
        local_path: &Path,
        folder: &str,
        on_log: LogFn<'_>,
    ) -> Result<String, StorageError> {
        on_log("[INFO] Opening backup file for upload...".to_string());

        let metadata = tokio::fs::metadata(local_path).await?;
        let file_size = metadata.len();

        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::Upload("invalid file name".to_string()))?;
        let object_key = self.folder_object_key(folder, file_name);

        on_log(format!(
            "[INFO] Uploading to bucket '{}' with key '{}' ({} bytes)",
            self.bucket, object_key, file_size
        ));

        if file_size > MULTIPART_THRESHOLD {
            let file = tokio::fs::File::open(local_path).await?;
            self.put_multipart(&object_key, file, DEFAULT_CONTENT_TYPE, on_log)
                .await?;
        } else {
            let body = ByteStream::from_path(local_path)
                .await
                .map_err(|e| StorageError::Upload(e.to_string()))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&object_key)
                .body(body)
                .content_type(DEFAULT_CONTENT_TYPE)
                .send()
                .await
                .map_err(|e| {
                    error!("single-part upload failed: {}", display_sdk_error(&e));
                    StorageError::Upload(display_sdk_error(&e))
                })?;
        }

        on_log("[INFO] Upload completed successfully".to_string());
        Ok(object_key)
    }

    /// Uploads an in-memory body in a single shot.
    pub async fn put_bytes(
        &self,
        object_key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Upload(display_sdk_error(&e)))?;
        Ok(())
    }

    /// Streams a reader through a gzip encoder into a multipart upload.
    ///
    /// The key follows `{prefix?}/{folder}/{file_name}.gz`.
    pub async fn put_stream_compressed<R>(
        &self,
        reader: R,
        file_name: &str,
        folder: &str,
        on_log: LogFn<'_>,
    ) -> Result<String, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let object_key = self.folder_object_key(folder, &format!("{}.gz", file_name));
        on_log(format!(
            "[INFO] Streaming compressed upload to '{}'",
            object_key
        ));

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        self.put_multipart_compressed(&object_key, reader, encoder, on_log)
            .await?;
        Ok(object_key)
    }

    /// Streams a reader of unknown length into a multipart upload without
    /// recompressing. Used when replicating an already-gzipped object to
    /// additional sinks.
    pub async fn put_stream<R>(
        &self,
        reader: R,
        file_name: &str,
        folder: &str,
        on_log: LogFn<'_>,
    ) -> Result<String, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let object_key = self.folder_object_key(folder, file_name);
        on_log(format!("[INFO] Streaming upload to '{}'", object_key));
        self.put_multipart(&object_key, reader, DEFAULT_CONTENT_TYPE, on_log)
            .await?;
        Ok(object_key)
    }

    async fn put_multipart<R>(
        &self,
        object_key: &str,
        mut reader: R,
        content_type: &str,
        on_log: LogFn<'_>,
    ) -> Result<(), StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let upload_id = self.create_multipart(object_key, content_type).await?;

        let mut parts = Vec::new();
        let mut part_number: i32 = 1;
        let mut buffer = Vec::with_capacity(MULTIPART_PART_SIZE);
        let mut chunk = vec![0u8; 64 * 1024];
        let mut total: u64 = 0;

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);

            if buffer.len() >= MULTIPART_PART_SIZE {
                let body = std::mem::replace(&mut buffer, Vec::with_capacity(MULTIPART_PART_SIZE));
                total += body.len() as u64;
                match self.upload_part(object_key, &upload_id, part_number, body).await {
                    Ok(part) => parts.push(part),
                    Err(e) => {
                        self.abort_multipart(object_key, &upload_id).await;
                        return Err(e);
                    }
                }
                part_number += 1;
            }
        }

        if !buffer.is_empty() || parts.is_empty() {
            total += buffer.len() as u64;
            match self
                .upload_part(object_key, &upload_id, part_number, buffer)
                .await
            {
                Ok(part) => parts.push(part),
                Err(e) => {
                    self.abort_multipart(object_key, &upload_id).await;
                    return Err(e);
                }
            }
        }

        self.complete_multipart(object_key, &upload_id, parts).await?;
        on_log(format!("[INFO] Uploaded {} bytes in {} part(s)", total, part_number));
        Ok(())
    }

    async fn put_multipart_compressed<R>(
        &self,
        object_key: &str,
        mut reader: R,
        mut encoder: GzEncoder<Vec<u8>>,
        on_log: LogFn<'_>,
    ) -> Result<(), StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let upload_id = self.create_multipart(object_key, "application/x-gzip").await?;

        let mut parts = Vec::new();
        let mut part_number: i32 = 1;
        let mut chunk = vec![0u8; 64 * 1024];
        let mut raw_total: u64 = 0;

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            raw_total += n as u64;
            encoder.write_all(&chunk[..n])?;

            // Drain the encoder's buffer one part at a time.
            while encoder.get_ref().len() >= MULTIPART_PART_SIZE {
                let compressed = std::mem::take(encoder.get_mut());
                let (body, rest) = split_part(compressed);
                *encoder.get_mut() = rest;

                match self.upload_part(object_key, &upload_id, part_number, body).await {
                    Ok(part) => parts.push(part),
                    Err(e) => {
                        self.abort_multipart(object_key, &upload_id).await;
                        return Err(e);
                    }
                }
                part_number += 1;
            }
        }

        let tail = match encoder.finish() {
            Ok(tail) => tail,
            Err(e) => {
                self.abort_multipart(object_key, &upload_id).await;
                return Err(StorageError::Io(e));
            }
        };

        // Gzip always emits a trailer, so the final part is never empty.
        let mut remaining = tail;
        loop {
            let (body, rest) = if remaining.len() > MULTIPART_PART_SIZE {
                split_part(remaining)
            } else {
                (std::mem::take(&mut remaining), Vec::new())
            };
            remaining = rest;

            match self
                .upload_part(object_key, &upload_id, part_number, body)
                .await
            {
                Ok(part) => parts.push(part),
                Err(e) => {
                    self.abort_multipart(object_key, &upload_id).await;
                    return Err(e);
                }
            }
            part_number += 1;

            if remaining.is_empty() {
                break;
            }
        }

        self.complete_multipart(object_key, &upload_id, parts).await?;
        on_log(format!(
            "[INFO] Compressed and uploaded {} raw bytes in {} part(s)",
            raw_total,
            part_number - 1
        ));
        Ok(())
    }

    async fn create_multipart(
        &self,
        object_key: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Upload(display_sdk_error(&e)))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Upload("no upload ID received".to_string()))
    }

    async fn upload_part(
        &self,
        object_key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<CompletedPart, StorageError> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(object_key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                error!("failed to upload part {}: {}", part_number, display_sdk_error(&e));
                StorageError::Upload(format!(
                    "part {} failed: {}",
                    part_number,
                    display_sdk_error(&e)
                ))
            })?;

        let etag = response
            .e_tag()
            .ok_or_else(|| StorageError::Upload(format!("no ETag for part {}", part_number)))?;

        Ok(CompletedPart::builder()
            .e_tag(etag)
            .part_number(part_number)
            .build())
    }

    async fn complete_multipart(
        &self,
        object_key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StorageError::Upload(display_sdk_error(&e)))?;
        Ok(())
    }

    async fn abort_multipart(&self, object_key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .upload_id(upload_id)
            .send()
            .await
        {
            error!("failed to abort multipart upload: {}", display_sdk_error(&e));
        }
    }

    /// Streaming download of an object body.
    pub async fn get_object(
        &self,
        object_key: &str,
    ) -> Result<impl AsyncRead + Unpin + Send, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| match e.code() {
                Some("NoSuchKey") => StorageError::NotFound(object_key.to_string()),
                _ => StorageError::Download(display_sdk_error(&e)),
            })?;
        Ok(response.body.into_async_read())
    }

    /// Size of an object in bytes.
    pub async fn stat_object(&self, object_key: &str) -> Result<i64, StorageError> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    StorageError::NotFound(object_key.to_string())
                } else {
                    StorageError::Download(display_sdk_error(&e))
                }
            })?;
        Ok(response.content_length().unwrap_or(0))
    }

    /// Lists object keys under the configured prefix.
    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let full_prefix = if prefix.is_empty() {
            self.prefix.clone()
        } else {
            self.object_key(prefix)
        };

        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(full_prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| StorageError::Download(display_sdk_error(&e)))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }

        Ok(keys)
    }

    pub async fn remove_object(&self, object_key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| StorageError::Upload(display_sdk_error(&e)))?;
        Ok(())
    }

    /// Cheap accessibility check used by the provider test endpoint.
    pub async fn test_connection(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify_probe_error(e.code(), e.to_string()))?;
        Ok(())
    }
}

/// Joins a prefix and file name into an object key.
pub fn derive_object_key(prefix: &str, file_name: &str) -> String {
    let file_name = file_name.trim_start_matches('/');
    if prefix.is_empty() {
        return file_name.to_string();
    }
    format!("{}/{}", prefix.trim_end_matches('/'), file_name)
}

fn split_part(mut buffer: Vec<u8>) -> (Vec<u8>, Vec<u8>) {
    let rest = buffer.split_off(MULTIPART_PART_SIZE.min(buffer.len()));
    (buffer, rest)
}

fn classify_probe_error(code: Option<&str>, message: String) -> StorageError {
    match code {
        Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") | Some("AuthorizationHeaderMalformed") => {
            StorageError::AuthFailed(message)
        }
        Some("AccessDenied") => StorageError::BucketInaccessible(message),
        _ => StorageError::BucketMissing(message),
    }
}

fn display_sdk_error<E>(err: &aws_sdk_s3::error::SdkError<E>) -> String
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match err.as_service_error() {
        Some(service_error) => format!(
            "{} (code: {})",
            service_error.message().unwrap_or("unknown error"),
            service_error.code().unwrap_or("none")
        ),
        None => format!("{:?}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_trims_separators() {
        assert_eq!(derive_object_key("", "file.sql"), "file.sql");
        assert_eq!(derive_object_key("prefix", "file.sql"), "prefix/file.sql");
        assert_eq!(derive_object_key("prefix/", "/file.sql"), "prefix/file.sql");
        assert_eq!(
            derive_object_key("a/b/", "shop_20250102_030405.sql.gz"),
            "a/b/shop_20250102_030405.sql.gz"
        );
    }

    #[test]
    fn split_part_respects_part_size() {
        let buffer = vec![1u8; MULTIPART_PART_SIZE + 10];
        let (part, rest) = split_part(buffer);
        assert_eq!(part.len(), MULTIPART_PART_SIZE);
        assert_eq!(rest.len(), 10);

        let (part, rest) = split_part(vec![1u8; 5]);
        assert_eq!(part.len(), 5);
        assert!(rest.is_empty());
    }

    #[test]
    fn probe_error_classification() {
        assert!(matches!(
            classify_probe_error(Some("InvalidAccessKeyId"), "x".into()),
            StorageError::AuthFailed(_)
        ));
        assert!(matches!(
            classify_probe_error(Some("SignatureDoesNotMatch"), "x".into()),
            StorageError::AuthFailed(_)
        ));
        assert!(matches!(
            classify_probe_error(Some("AccessDenied"), "x".into()),
            StorageError::BucketInaccessible(_)
        ));
        assert!(matches!(
            classify_probe_error(None, "x".into()),
            StorageError::BucketMissing(_)
        ));
    }

    #[tokio::test]
    async fn connect_rejects_empty_credentials() {
        let config = S3Config {
            endpoint: "s3.example.com".to_string(),
            region: None,
            bucket: "bucket".to_string(),
            access_key: " \u{200b} ".to_string(),
            secret_key: "secret".to_string(),
            use_ssl: true,
            path_prefix: None,
        };

        let err = ObjectStore::connect(config).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidCredential { ref field } if field == "access_key"));
    }

    #[tokio::test]
    async fn connect_rejects_empty_endpoint() {
        let config = S3Config {
            endpoint: "   ".to_string(),
            region: None,
            bucket: "bucket".to_string(),
            access_key: "key".to_string(),
            secret_key: "secret".to_string(),
            use_ssl: true,
            path_prefix: None,
        };

        let err = ObjectStore::connect(config).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidCredential { ref field } if field == "endpoint"));
    }
}
