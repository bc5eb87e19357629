//! The backup coordinator.
//!
//! One coordinator task owns a backup end to end: the dump subprocess and
//! its pipes, the optional SSH tunnel, the log channel and the backup row.
//! Streamable engines pipe stdout through a checksum tee and gzip into the
//! first sink, then replicate by re-reading the stored object; the rest
//! stage to disk and fan out file uploads. Terminal status, bindings,
//! digests and notification all happen here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::checksum::{file_checksums, verify_file_checksum, ChecksumTee};
use keel_core::notifications::{format_bytes, BackupNotifier};
use keel_core::sanitize::sanitize_connection_name;
use keel_entities::{backups, backups::Model as Backup, s3_providers};
use keel_storage::ObjectStore;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf};
use tokio::process::Child;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::services::driver;
use crate::services::error::BackupError;
use crate::services::log_bus::LogBus;
use crate::services::notify;
use crate::services::providers::{to_s3_config, S3ProviderService};
use crate::services::registry::{ConnectionRegistry, ResolvedConnection};
use crate::services::repository::BackupRepository;
use crate::services::tunnel::{SshTunnel, TunnelConfig};

/// Delay before the log channel closes, letting live viewers drain.
const LOG_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// How long a canceled subprocess gets to exit after SIGTERM before it
/// is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

pub struct BackupService {
    registry: Arc<ConnectionRegistry>,
    backup_root: PathBuf,
    repo: Arc<BackupRepository>,
    providers: Arc<S3ProviderService>,
    log_bus: Arc<LogBus>,
    notifier: Arc<dyn BackupNotifier>,
    active_runs: StdMutex<HashMap<Uuid, CancellationToken>>,
}

impl BackupService {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        backup_root: PathBuf,
        repo: Arc<BackupRepository>,
        providers: Arc<S3ProviderService>,
        log_bus: Arc<LogBus>,
        notifier: Arc<dyn BackupNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            backup_root,
            repo,
            providers,
            log_bus,
            notifier,
            active_runs: StdMutex::new(HashMap::new()),
        })
    }

    /// Requests cancellation of a running backup. The coordinator task
    /// terminates the subprocess, closes its pipes and marks the backup
    /// failed with a canceled reason.
    pub fn cancel_backup(&self, backup_id: Uuid) -> Result<(), BackupError> {
        let runs = self.active_runs.lock().unwrap();
        match runs.get(&backup_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(BackupError::NotFound(format!(
                "No active run for backup {}",
                backup_id
            ))),
        }
    }

    fn unregister_run(&self, backup_id: Uuid) {
        self.active_runs.lock().unwrap().remove(&backup_id);
    }

    pub fn repo(&self) -> &Arc<BackupRepository> {
        &self.repo
    }

    pub fn log_bus(&self) -> &Arc<LogBus> {
        &self.log_bus
    }

    pub fn provider_service(&self) -> &Arc<S3ProviderService> {
        &self.providers
    }

    pub fn connection_registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Durably creates the backup row and its log channel, then runs the
    /// pipeline asynchronously. Returns as soon as both exist.
    pub async fn start_backup(
        self: Arc<Self>,
        connection_id: Uuid,
        provider_ids: Vec<Uuid>,
        schedule_id: Option<Uuid>,
    ) -> Result<Backup, BackupError> {
        let conn = self.registry.get_connection(connection_id).await?;
        driver::verify_backup_tools(&conn.engine)?;

        let backup_id = Uuid::new_v4();
        let now = Utc::now();
        let filename = dump_filename(&conn.database_name, now);

        let connection_folder = self.backup_root.join(sanitize_connection_name(&conn.name));
        tokio::fs::create_dir_all(&connection_folder).await?;
        let backup_path = connection_folder.join(&filename);

        let backup = Backup {
            id: backup_id,
            connection_id,
            schedule_id,
            status: backups::STATUS_IN_PROGRESS.to_string(),
            path: backup_path.to_string_lossy().to_string(),
            s3_object_key: None,
            s3_provider_id: None,
            size: 0,
            md5_hash: None,
            sha256_hash: None,
            logs: None,
            started_time: now,
            completed_time: None,
            created_at: now,
            updated_at: now,
        };

        // The log channel must exist before the row so no early emit is
        // lost, and the row must exist before the run so logs can land.
        self.log_bus.open_channel(backup_id);
        if let Err(e) = self.repo.create_backup(backup.clone()).await {
            self.log_bus.close(backup_id).await;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        self.active_runs
            .lock()
            .unwrap()
            .insert(backup_id, cancel.clone());

        let service = Arc::clone(&self);
        let returned = backup.clone();
        tokio::spawn(async move {
            service
                .execute_backup(backup, conn, filename, provider_ids, cancel)
                .await;
        });

        Ok(returned)
    }

    async fn execute_backup(
        self: Arc<Self>,
        mut backup: Backup,
        mut conn: ResolvedConnection,
        filename: String,
        provider_ids: Vec<Uuid>,
        cancel: CancellationToken,
    ) {
        let backup_id = backup.id;

        // Tunnel first: every later step talks to the effective endpoint.
        let mut tunnel: Option<SshTunnel> = None;
        if conn.ssh_enabled {
            match self.open_tunnel(&conn).await {
                Ok(opened) => {
                    conn.host = "127.0.0.1".to_string();
                    conn.port = opened.local_port() as i32;
                    tunnel = Some(opened);
                }
                Err(e) => {
                    self.log_bus
                        .emit(backup_id, format!("[ERROR] Failed to setup SSH tunnel: {}", e));
                    self.finish_failed(&mut backup, &conn, &e).await;
                    self.unregister_run(backup_id);
                    self.schedule_log_close(backup_id);
                    return;
                }
            }
        }

        let providers = self.resolve_providers(backup_id, &conn, &provider_ids).await;

        let result = if !providers.is_empty() && driver::is_streamable(&conn.engine) {
            self.run_streaming_backup(&mut backup, &conn, &filename, &providers, &cancel)
                .await
        } else {
            if !providers.is_empty() {
                self.log_bus.emit(
                    backup_id,
                    format!(
                        "[INFO] {} does not support stdout streaming, using file-based backup",
                        conn.engine
                    ),
                );
            }
            self.run_file_backup(&mut backup, &conn, &providers, &cancel)
                .await
        };

        if let Err(e) = result {
            self.finish_failed(&mut backup, &conn, &e).await;
        }

        // Tear the tunnel down on every exit path.
        if let Some(mut tunnel) = tunnel.take() {
            tokio::task::spawn_blocking(move || tunnel.stop())
                .await
                .ok();
        }

        self.unregister_run(backup_id);
        self.schedule_log_close(backup_id);
    }

    async fn open_tunnel(&self, conn: &ResolvedConnection) -> Result<SshTunnel, BackupError> {
        let config = TunnelConfig {
            ssh_host: conn
                .ssh_host
                .clone()
                .ok_or_else(|| BackupError::TunnelSetupFailed("SSH host missing".to_string()))?,
            ssh_port: conn.ssh_port.unwrap_or(22) as u16,
            ssh_username: conn.ssh_username.clone().ok_or_else(|| {
                BackupError::TunnelSetupFailed("SSH username missing".to_string())
            })?,
            ssh_password: conn.ssh_password.clone(),
            ssh_private_key: conn.ssh_private_key.clone(),
            target_host: conn.host.clone(),
            target_port: conn.port as u16,
        };

        tokio::task::spawn_blocking(move || SshTunnel::open(config))
            .await
            .map_err(|e| BackupError::TunnelSetupFailed(e.to_string()))?
    }

    /// Sink resolution order: explicit ids, else all of the owner's
    /// providers, else the owner's default, else none.
    async fn resolve_providers(
        &self,
        backup_id: Uuid,
        conn: &ResolvedConnection,
        provider_ids: &[Uuid],
    ) -> Vec<s3_providers::Model> {
        if !provider_ids.is_empty() {
            let mut providers = Vec::new();
            for id in provider_ids {
                match self.providers.provider_for_upload(*id, conn.user_id).await {
                    Ok(provider) => providers.push(provider),
                    Err(e) => self.log_bus.emit(
                        backup_id,
                        format!("[WARNING] Failed to get S3 provider {}: {}", id, e),
                    ),
                }
            }
            return providers;
        }

        match self.providers.all_providers_for_upload(conn.user_id).await {
            Ok(providers) if !providers.is_empty() => {
                self.log_bus.emit(
                    backup_id,
                    format!(
                        "[INFO] Found {} S3 provider(s), will upload to all of them",
                        providers.len()
                    ),
                );
                providers
            }
            _ => match self.providers.get_default_provider(conn.user_id).await {
                Ok(Some(default)) => {
                    match self
                        .providers
                        .provider_for_upload(default.id, conn.user_id)
                        .await
                    {
                        Ok(provider) => {
                            self.log_bus
                                .emit(backup_id, "[INFO] Using default S3 provider");
                            vec![provider]
                        }
                        Err(_) => Vec::new(),
                    }
                }
                _ => Vec::new(),
            },
        }
    }

    async fn emit_postgres_preflight(&self, backup_id: Uuid, conn: &ResolvedConnection) {
        let mut client_version = String::new();
        match driver::pg_dump_client_version().await {
            Ok(version) => {
                self.log_bus
                    .emit(backup_id, format!("[INFO] pg_dump client version: {}", version));
                client_version = version;
            }
            Err(e) => self.log_bus.emit(
                backup_id,
                format!("[WARNING] Could not determine pg_dump version: {}", e),
            ),
        }

        match driver::postgres_server_version(conn).await {
            Ok(server_version) => {
                self.log_bus.emit(
                    backup_id,
                    format!("[INFO] PostgreSQL server version: {}", server_version),
                );

                let client_major = driver::extract_pg_major_version(&client_version);
                let server_major = driver::extract_pg_major_version(&server_version);
                if let (Some(client), Some(server)) = (client_major, server_major) {
                    if client != server {
                        self.log_bus.emit(
                            backup_id,
                            format!(
                                "[WARNING] Version mismatch detected! Client: {}, Server: {}",
                                client, server
                            ),
                        );
                        self.log_bus.emit(
                            backup_id,
                            "[WARNING] The backup may fail. Please install PostgreSQL client tools matching your server version.",
                        );
                    }
                }
            }
            Err(e) => self.log_bus.emit(
                backup_id,
                format!(
                    "[INFO] Could not determine server version: {} (this is not critical)",
                    e
                ),
            ),
        }

        if driver::is_timescaledb_installed(conn).await {
            self.log_bus
                .emit(backup_id, "[INFO] TimescaleDB extension detected in database");
            self.log_bus.emit(
                backup_id,
                "[INFO] Warnings about circular foreign keys in hypertable, chunk, and continuous_agg tables are expected and safe to ignore",
            );
        }
    }

    async fn run_streaming_backup(
        &self,
        backup: &mut Backup,
        conn: &ResolvedConnection,
        filename: &str,
        providers: &[s3_providers::Model],
        cancel: &CancellationToken,
    ) -> Result<(), BackupError> {
        let backup_id = backup.id;
        let folder = sanitize_connection_name(&conn.name);

        self.log_bus.emit(
            backup_id,
            format!(
                "Starting streaming backup for {} database '{}' on {}:{}",
                conn.engine, conn.database_name, conn.host, conn.port
            ),
        );
        self.log_bus.emit(
            backup_id,
            format!("Backup will be streamed directly to S3: {}", filename),
        );
        self.log_bus.emit(
            backup_id,
            "[INFO] Using streaming mode - no local file will be created",
        );

        if conn.engine == "postgresql" {
            self.emit_postgres_preflight(backup_id, conn).await;
        }

        let first = &providers[0];
        let first_store = Arc::new(
            ObjectStore::connect(to_s3_config(first))
                .await
                .map_err(|e| {
                    self.log_bus
                        .emit(backup_id, format!("[ERROR] Failed to create S3 client: {}", e));
                    BackupError::Storage(e)
                })?,
        );

        self.log_bus.emit(
            backup_id,
            format!(
                "[INFO] Starting streaming upload to {} S3 provider(s)...",
                providers.len()
            ),
        );
        self.log_bus.emit(
            backup_id,
            format!("[INFO] Streaming compressed backup to {}", first.name),
        );
        self.log_bus
            .emit(backup_id, format!("[INFO] Bucket: {}", first_store.bucket()));
        self.log_bus
            .emit(backup_id, format!("[INFO] Connection folder: {}", folder));

        let mut command = driver::streaming_dump_command(conn)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackupError::ToolMissing {
                    engine: conn.engine.clone(),
                    tool: driver::required_tool(&conn.engine).unwrap_or("dump tool").to_string(),
                }
            } else {
                BackupError::SubprocessFailed(format!("failed to start backup command: {}", e))
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::SubprocessFailed("no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackupError::SubprocessFailed("no stderr pipe".to_string()))?;

        // Stderr reader keeps the full tail for the failure summary.
        let stderr_lines: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let stderr_task = {
            let bus = Arc::clone(&self.log_bus);
            let lines = Arc::clone(&stderr_lines);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    lines.lock().unwrap().push(line.clone());
                    bus.emit(backup_id, line);
                }
            })
        };

        let tee = Arc::new(StdMutex::new(ChecksumTee::new()));
        let reader = ChecksumReader {
            inner: stdout,
            tee: Arc::clone(&tee),
        };

        let provider_name = first.name.clone();
        let bus = Arc::clone(&self.log_bus);
        let on_log = move |message: String| {
            bus.emit(backup_id, format!("[{}] {}", provider_name, message));
        };

        let upload_result = tokio::select! {
            result = first_store.put_stream_compressed(reader, filename, &folder, &on_log) => result,
            _ = cancel.cancelled() => {
                terminate_subprocess(&mut child).await;
                return Err(BackupError::Canceled);
            }
        };

        // The waiter only declares completion after both readers hit EOF:
        // the upload consumed stdout, the stderr task drains the other.
        let _ = stderr_task.await;
        let status = child.wait().await;

        let collected_stderr = stderr_lines.lock().unwrap().clone();
        let subprocess_failed = match &status {
            Ok(status) => !status.success(),
            Err(_) => true,
        };

        if subprocess_failed || upload_result.is_err() {
            let mut message = match (&status, &upload_result) {
                (Ok(status), _) if !status.success() => format!("exit status {}", status),
                (Err(e), _) => e.to_string(),
                (_, Err(e)) => format!("Failed to upload to {}: {}", first.name, e),
                _ => String::new(),
            };
            if let Some(last) = collected_stderr.last() {
                message = format!("{} - {}", message, last);
            }

            if driver::is_version_mismatch_error(&collected_stderr) {
                self.log_bus.emit(
                    backup_id,
                    "[ERROR] pg_dump aborted due to a server version mismatch. Install PostgreSQL client tools matching the server version and retry.",
                );
                return Err(BackupError::VersionMismatch(message));
            }
            return Err(BackupError::SubprocessFailed(message));
        }

        let uploaded_key = upload_result.expect("checked above");

        // Record digests computed over the raw dump bytes
        let checksum_tee = std::mem::take(&mut *tee.lock().unwrap());
        let (md5, sha256) = checksum_tee.finalize();
        backup.md5_hash = Some(md5);
        backup.sha256_hash = Some(sha256);

        match first_store.stat_object(&uploaded_key).await {
            Ok(size) => {
                backup.size = size;
                self.log_bus.emit(
                    backup_id,
                    format!(
                        "[SUCCESS] Backup streamed successfully. Size: {}",
                        format_bytes(size)
                    ),
                );
                self.log_bus.emit(
                    backup_id,
                    format!(
                        "[INFO] File verified in S3: s3://{}/{}",
                        first_store.bucket(),
                        uploaded_key
                    ),
                );
            }
            Err(e) => {
                self.log_bus.emit(
                    backup_id,
                    format!("[WARNING] Could not verify file size in S3: {}", e),
                );
            }
        }

        backup.s3_object_key = Some(uploaded_key.clone());
        backup.s3_provider_id = Some(first.id);
        if let Err(e) = self
            .repo
            .add_backup_provider(backup_id, first.id, &uploaded_key)
            .await
        {
            self.log_bus
                .emit(backup_id, format!("[WARNING] Failed to track S3 provider: {}", e));
        }

        // Remaining sinks re-read the object the first sink persisted.
        let mut copy_errors = Vec::new();
        if providers.len() > 1 {
            self.log_bus.emit(
                backup_id,
                format!(
                    "[INFO] Copying backup to {} additional S3 provider(s)...",
                    providers.len() - 1
                ),
            );
            copy_errors = self
                .copy_to_additional_sinks(
                    backup_id,
                    Arc::clone(&first_store),
                    &uploaded_key,
                    &folder,
                    &providers[1..],
                )
                .await;
        }

        let succeeded = providers.len() - copy_errors.len();
        backup.status = fan_out_status(succeeded, providers.len()).to_string();
        backup.completed_time = Some(Utc::now());

        let error_summary = if copy_errors.is_empty() {
            self.log_bus.emit(
                backup_id,
                "[SUCCESS] Backup completed and streamed to all S3 providers successfully",
            );
            None
        } else {
            let joined = copy_errors.join("; ");
            self.log_bus.emit(
                backup_id,
                format!(
                    "[WARNING] Uploaded to {}/{} providers. Errors: {}",
                    succeeded,
                    providers.len(),
                    joined
                ),
            );
            Some(joined)
        };

        self.persist_and_notify(backup, conn, error_summary.as_deref()).await;
        Ok(())
    }

    /// Downloads the object from the first sink and re-streams it to each
    /// additional sink in parallel. Returns one error string per failed
    /// sink; successes get their binding recorded.
    async fn copy_to_additional_sinks(
        &self,
        backup_id: Uuid,
        source: Arc<ObjectStore>,
        source_key: &str,
        folder: &str,
        providers: &[s3_providers::Model],
    ) -> Vec<String> {
        let file_name = source_key
            .rsplit('/')
            .next()
            .unwrap_or(source_key)
            .to_string();

        let mut tasks = JoinSet::new();
        for provider in providers.iter().cloned() {
            let source = Arc::clone(&source);
            let source_key = source_key.to_string();
            let folder = folder.to_string();
            let file_name = file_name.clone();
            let bus = Arc::clone(&self.log_bus);
            let repo = Arc::clone(&self.repo);

            tasks.spawn(async move {
                let name = provider.name.clone();
                bus.emit(backup_id, format!("[INFO] Copying backup to provider: {}", name));

                let result: Result<String, BackupError> = async {
                    let dest = ObjectStore::connect(to_s3_config(&provider)).await?;
                    let object = source.get_object(&source_key).await?;
                    let log_bus = Arc::clone(&bus);
                    let log_name = name.clone();
                    let on_log = move |message: String| {
                        log_bus.emit(backup_id, format!("[{}] {}", log_name, message));
                    };
                    let key = dest.put_stream(object, &file_name, &folder, &on_log).await?;
                    Ok(key)
                }
                .await;

                match result {
                    Ok(key) => {
                        if let Err(e) = repo.add_backup_provider(backup_id, provider.id, &key).await
                        {
                            bus.emit(
                                backup_id,
                                format!("[WARNING] Failed to track S3 provider {}: {}", name, e),
                            );
                        }
                        bus.emit(
                            backup_id,
                            format!("[SUCCESS] Backup copied to {}: {}", name, key),
                        );
                        None
                    }
                    Err(e) => {
                        let message = format!("Failed to upload to {}: {}", name, e);
                        bus.emit(backup_id, format!("[ERROR] {}", message));
                        Some(message)
                    }
                }
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(error_message)) => errors.push(error_message),
                Ok(None) => {}
                Err(e) => errors.push(format!("copy task panicked: {}", e)),
            }
        }
        errors
    }

    async fn run_file_backup(
        &self,
        backup: &mut Backup,
        conn: &ResolvedConnection,
        providers: &[s3_providers::Model],
        cancel: &CancellationToken,
    ) -> Result<(), BackupError> {
        let backup_id = backup.id;
        let backup_path = PathBuf::from(&backup.path);
        let folder = sanitize_connection_name(&conn.name);

        self.log_bus.emit(
            backup_id,
            format!(
                "Starting backup for {} database '{}' on {}:{}",
                conn.engine, conn.database_name, conn.host, conn.port
            ),
        );
        if let Some(name) = backup_path.file_name().and_then(|n| n.to_str()) {
            self.log_bus
                .emit(backup_id, format!("Backup file: {}", name));
        }

        let mut command = driver::file_dump_command(conn, &backup_path)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackupError::ToolMissing {
                    engine: conn.engine.clone(),
                    tool: driver::required_tool(&conn.engine).unwrap_or("dump tool").to_string(),
                }
            } else {
                BackupError::SubprocessFailed(format!("failed to start backup command: {}", e))
            }
        })?;

        let output_lines: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        let stdout_task = child.stdout.take().map(|stdout| {
            let bus = Arc::clone(&self.log_bus);
            let lines = Arc::clone(&output_lines);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    lines.lock().unwrap().push(line.clone());
                    bus.emit(backup_id, line);
                }
            })
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            let bus = Arc::clone(&self.log_bus);
            let lines = Arc::clone(&output_lines);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    lines.lock().unwrap().push(line.clone());
                    bus.emit(backup_id, format!("[STDERR] {}", line));
                }
            })
        });

        // Both readers must reach EOF before completion is declared.
        let readers_done = async {
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
        };
        tokio::select! {
            _ = readers_done => {}
            _ = cancel.cancelled() => {
                terminate_subprocess(&mut child).await;
                return Err(BackupError::Canceled);
            }
        }
        let status = child.wait().await;

        let failed = match &status {
            Ok(status) => !status.success(),
            Err(_) => true,
        };
        if failed {
            let collected = output_lines.lock().unwrap().clone();
            let message = summarize_failure(
                status
                    .as_ref()
                    .map(|s| format!("exit status {}", s))
                    .unwrap_or_else(|e| e.to_string()),
                &collected,
            );
            return Err(BackupError::SubprocessFailed(format!(
                "backup failed for {} database '{}' on {}:{} - {}",
                conn.engine, conn.database_name, conn.host, conn.port, message
            )));
        }

        let metadata = tokio::fs::metadata(&backup_path).await?;
        backup.size = metadata.len() as i64;
        backup.completed_time = Some(Utc::now());

        let checksum_path = backup_path.clone();
        let (md5, sha256) = tokio::task::spawn_blocking(move || file_checksums(&checksum_path))
            .await
            .map_err(|e| BackupError::Internal(e.to_string()))??;
        backup.md5_hash = Some(md5);
        backup.sha256_hash = Some(sha256);

        self.log_bus.emit(
            backup_id,
            format!("Backup completed successfully. Size: {} bytes", backup.size),
        );

        if providers.is_empty() {
            self.log_bus.emit(
                backup_id,
                "[INFO] No S3 providers configured, backup saved locally only",
            );
            backup.status = backups::STATUS_SUCCESS.to_string();
            self.persist_and_notify(backup, conn, None).await;
            return Ok(());
        }

        let (successes, upload_errors) = self
            .upload_file_to_sinks(backup_id, &backup_path, &folder, providers)
            .await;

        for (provider_id, key) in &successes {
            if backup.s3_object_key.is_none() {
                backup.s3_object_key = Some(key.clone());
                backup.s3_provider_id = Some(*provider_id);
            }
            if let Err(e) = self.repo.add_backup_provider(backup_id, *provider_id, key).await {
                self.log_bus
                    .emit(backup_id, format!("[WARNING] Failed to track S3 provider: {}", e));
            }
        }

        backup.status = fan_out_status(successes.len(), providers.len()).to_string();

        let error_summary = if upload_errors.is_empty() {
            self.log_bus.emit(
                backup_id,
                "[SUCCESS] Backup completed and uploaded to all S3 providers successfully",
            );
            None
        } else if successes.is_empty() {
            let joined = upload_errors.join("; ");
            self.log_bus.emit(
                backup_id,
                format!(
                    "[WARNING] Backup completed but all S3 uploads failed: {}",
                    joined
                ),
            );
            Some(joined)
        } else {
            let joined = upload_errors.join("; ");
            self.log_bus.emit(
                backup_id,
                format!(
                    "[WARNING] Uploaded to {}/{} providers. Errors: {}",
                    successes.len(),
                    providers.len(),
                    joined
                ),
            );
            Some(joined)
        };

        // The staging file survives unless at least one sink holds a copy.
        if !successes.is_empty() {
            match tokio::fs::remove_file(&backup_path).await {
                Ok(()) => self.log_bus.emit(
                    backup_id,
                    format!("[INFO] Local backup file removed: {}", backup.path),
                ),
                Err(e) => self.log_bus.emit(
                    backup_id,
                    format!("[WARNING] Failed to remove local backup file: {}", e),
                ),
            }
        }

        self.persist_and_notify(backup, conn, error_summary.as_deref()).await;
        Ok(())
    }

    /// One upload worker per sink, each with its own client handle.
    async fn upload_file_to_sinks(
        &self,
        backup_id: Uuid,
        path: &Path,
        folder: &str,
        providers: &[s3_providers::Model],
    ) -> (Vec<(Uuid, String)>, Vec<String>) {
        let mut tasks = JoinSet::new();
        for provider in providers.iter().cloned() {
            let bus = Arc::clone(&self.log_bus);
            let path = path.to_path_buf();
            let folder = folder.to_string();

            tasks.spawn(async move {
                let name = provider.name.clone();
                bus.emit(
                    backup_id,
                    format!("[INFO] Starting S3 upload to provider: {}", name),
                );
                bus.emit(
                    backup_id,
                    format!(
                        "[INFO] S3 Configuration: Provider={}, Endpoint={}, Bucket={}",
                        name, provider.endpoint, provider.bucket
                    ),
                );

                let result: Result<String, BackupError> = async {
                    let store = ObjectStore::connect(to_s3_config(&provider)).await?;
                    let log_bus = Arc::clone(&bus);
                    let log_name = name.clone();
                    let on_log = move |message: String| {
                        log_bus.emit(backup_id, format!("[{}] {}", log_name, message));
                    };
                    let key = store.put_file(&path, &folder, &on_log).await?;
                    Ok(key)
                }
                .await;

                match result {
                    Ok(key) => {
                        bus.emit(
                            backup_id,
                            format!("[SUCCESS] Backup successfully uploaded to {}: {}", name, key),
                        );
                        Ok((provider.id, key))
                    }
                    Err(e) => {
                        let message = format!("Failed to upload to {}: {}", name, e);
                        bus.emit(backup_id, format!("[ERROR] {}", message));
                        Err(message)
                    }
                }
            });
        }

        let mut successes = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(success)) => successes.push(success),
                Ok(Err(message)) => errors.push(message),
                Err(e) => errors.push(format!("upload task panicked: {}", e)),
            }
        }
        (successes, errors)
    }

    async fn persist_and_notify(
        &self,
        backup: &Backup,
        conn: &ResolvedConnection,
        error_summary: Option<&str>,
    ) {
        if let Err(e) = self.repo.update_backup(backup).await {
            self.log_bus
                .emit(backup.id, format!("[ERROR] Failed to update backup: {}", e));
            error!("failed to update backup {}: {}", backup.id, e);
        }

        if let Some(event) = notify::build_event(backup, conn, error_summary) {
            notify::dispatch(Arc::clone(&self.notifier), event);
        }
    }

    async fn finish_failed(
        &self,
        backup: &mut Backup,
        conn: &ResolvedConnection,
        err: &BackupError,
    ) {
        self.log_bus
            .emit(backup.id, format!("[ERROR] Backup failed: {}", err));

        backup.status = backups::STATUS_FAILED.to_string();
        backup.completed_time = Some(Utc::now());
        self.persist_and_notify(backup, conn, Some(&err.to_string())).await;
    }

    fn schedule_log_close(&self, backup_id: Uuid) {
        let bus = Arc::clone(&self.log_bus);
        tokio::spawn(async move {
            tokio::time::sleep(LOG_CLOSE_GRACE).await;
            bus.close(backup_id).await;
        });
    }

    // ----- downloads -----

    /// Opens a download stream for a backup, preferring the requested
    /// provider, then the primary binding, then any binding, then the
    /// local staging file.
    pub async fn open_download(
        &self,
        backup_id: Uuid,
        provider_id: Option<Uuid>,
    ) -> Result<(String, Box<dyn AsyncRead + Send + Unpin>), BackupError> {
        let backup = self.repo.get_backup(backup_id).await?;
        let conn = self.registry.get_connection(backup.connection_id).await?;
        let bindings = self.repo.get_backup_providers(backup_id).await?;

        let binding = match provider_id {
            Some(requested) => bindings
                .iter()
                .find(|b| b.s3_provider_id == requested)
                .cloned(),
            None => bindings
                .iter()
                .find(|b| Some(b.s3_provider_id) == backup.s3_provider_id)
                .or(bindings.first())
                .cloned(),
        };

        if let Some(binding) = binding {
            let provider = self
                .providers
                .provider_for_upload(binding.s3_provider_id, conn.user_id)
                .await?;
            let store = ObjectStore::connect(to_s3_config(&provider)).await?;
            let reader = store.get_object(&binding.s3_object_key).await?;
            let filename = binding
                .s3_object_key
                .rsplit('/')
                .next()
                .unwrap_or("backup")
                .to_string();
            return Ok((filename, Box::new(reader)));
        }

        if provider_id.is_some() {
            return Err(BackupError::NotFound("S3 object not found".to_string()));
        }

        // Local fallback for backups that never reached a sink
        let path = PathBuf::from(&backup.path);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let file = tokio::fs::File::open(&path).await?;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("backup")
                .to_string();
            return Ok((filename, Box::new(file)));
        }

        Err(BackupError::NotFound("Backup artifact not found".to_string()))
    }

    // ----- restore -----

    /// Restores a stored backup into a connection: download, gunzip when
    /// needed, verify the recorded SHA-256 (unless skipped), then drive
    /// the engine's restore tool.
    pub async fn restore_backup(
        &self,
        backup_id: Uuid,
        connection_id: Uuid,
        skip_checksum: bool,
    ) -> Result<(), BackupError> {
        let backup = self.repo.get_backup(backup_id).await?;
        let conn = self.registry.get_connection(connection_id).await?;
        driver::verify_backup_tools(&conn.engine)?;

        info!("restoring backup {} into {}", backup_id, conn.database_name);

        let staging = tempfile::Builder::new()
            .prefix("keel-restore-")
            .tempdir()
            .map_err(BackupError::Io)?;

        let downloaded = self
            .fetch_backup_artifact(&backup, &conn, staging.path())
            .await?;

        let dump_path = if downloaded
            .extension()
            .map(|e| e == "gz")
            .unwrap_or(false)
        {
            let decompressed = staging.path().join(
                downloaded
                    .file_stem()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("restore.sql")),
            );
            let source = downloaded.clone();
            let target = decompressed.clone();
            tokio::task::spawn_blocking(move || gunzip_file(&source, &target))
                .await
                .map_err(|e| BackupError::Internal(e.to_string()))??;
            decompressed
        } else {
            downloaded
        };

        if !skip_checksum {
            if let Some(expected) = backup.sha256_hash.clone() {
                let verify_path = dump_path.clone();
                tokio::task::spawn_blocking(move || {
                    verify_file_checksum(&verify_path, &expected)
                })
                .await
                .map_err(|e| BackupError::Internal(e.to_string()))??;
            }
        }

        let (mut command, pipe_stdin) = driver::restore_command(&conn, &dump_path)?;
        if pipe_stdin {
            let input = std::fs::File::open(&dump_path)?;
            command.stdin(Stdio::from(input));
        } else {
            command.stdin(Stdio::null());
        }

        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                BackupError::SubprocessFailed(format!("failed to run restore tool: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::SubprocessFailed(format!(
                "restore failed: {}",
                stderr.trim()
            )));
        }

        info!("backup {} restored successfully", backup_id);
        Ok(())
    }

    /// Downloads the backup body into the staging directory, preferring
    /// the primary binding and falling back to the local staging file.
    async fn fetch_backup_artifact(
        &self,
        backup: &Backup,
        conn: &ResolvedConnection,
        staging: &Path,
    ) -> Result<PathBuf, BackupError> {
        let bindings = self.repo.get_backup_providers(backup.id).await?;
        let binding = bindings
            .iter()
            .find(|b| Some(b.s3_provider_id) == backup.s3_provider_id)
            .or(bindings.first());

        if let Some(binding) = binding {
            let provider = self
                .providers
                .provider_for_upload(binding.s3_provider_id, conn.user_id)
                .await?;
            let store = ObjectStore::connect(to_s3_config(&provider)).await?;
            let mut reader = store.get_object(&binding.s3_object_key).await?;

            let file_name = binding
                .s3_object_key
                .rsplit('/')
                .next()
                .unwrap_or("backup.sql.gz");
            let target = staging.join(file_name);
            let mut file = tokio::fs::File::create(&target).await?;
            tokio::io::copy(&mut reader, &mut file).await?;
            return Ok(target);
        }

        let local = PathBuf::from(&backup.path);
        if tokio::fs::try_exists(&local).await.unwrap_or(false) {
            return Ok(local);
        }

        Err(BackupError::NotFound(
            "backup has no stored object and no local file".to_string(),
        ))
    }
}

/// `{databaseName}_{YYYYMMDD_HHMMSS}.sql`
fn dump_filename(database_name: &str, now: DateTime<Utc>) -> String {
    format!("{}_{}.sql", database_name, now.format("%Y%m%d_%H%M%S"))
}

/// Terminal status from the fan-out outcome. No sinks counts as success:
/// the backup is retained locally.
fn fan_out_status(succeeded: usize, total: usize) -> &'static str {
    if total == 0 || succeeded == total {
        backups::STATUS_SUCCESS
    } else {
        backups::STATUS_COMPLETED_WITH_ERRORS
    }
}

/// Failure summary preferring the last captured output line.
fn summarize_failure(fallback: String, lines: &[String]) -> String {
    match lines.last() {
        Some(last) if !last.is_empty() => last.clone(),
        _ => fallback,
    }
}

fn gunzip_file(source: &Path, target: &Path) -> Result<(), BackupError> {
    let input = std::fs::File::open(source)?;
    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut output = std::fs::File::create(target)?;
    std::io::copy(&mut decoder, &mut output)?;
    Ok(())
}

/// Terminates a canceled dump subprocess: SIGTERM first, SIGKILL once
/// the grace period runs out. Dropping the child afterwards closes the
/// remaining pipes.
async fn terminate_subprocess(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if tokio::time::timeout(TERMINATE_GRACE, child.wait())
        .await
        .is_err()
    {
        let _ = child.kill().await;
    }
}

/// AsyncRead adapter feeding every read chunk through the checksum tee.
struct ChecksumReader<R> {
    inner: R,
    tee: Arc<StdMutex<ChecksumTee>>,
}

impl<R: AsyncRead + Unpin> AsyncRead for ChecksumReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let filled = &buf.filled()[before..];
            if !filled.is_empty() {
                this.tee.lock().unwrap().update(filled);
            }
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::notifications::{BackupEventData, NotificationError};
    use keel_database::test_utils::TestDatabase;
    use tokio::io::AsyncReadExt;

    struct NoopNotifier;

    #[async_trait::async_trait]
    impl BackupNotifier for NoopNotifier {
        async fn notify(&self, _event: BackupEventData) -> Result<(), NotificationError> {
            Ok(())
        }
    }

    #[test]
    fn fan_out_status_mapping() {
        // No sinks: local-only backup is still a success
        assert_eq!(fan_out_status(0, 0), backups::STATUS_SUCCESS);
        assert_eq!(fan_out_status(2, 2), backups::STATUS_SUCCESS);
        assert_eq!(fan_out_status(1, 2), backups::STATUS_COMPLETED_WITH_ERRORS);
        assert_eq!(fan_out_status(0, 3), backups::STATUS_COMPLETED_WITH_ERRORS);
    }

    #[test]
    fn failure_summary_prefers_last_output_line() {
        let lines = vec![
            "reading tables".to_string(),
            "pg_dump: error: connection refused".to_string(),
        ];
        assert_eq!(
            summarize_failure("exit status 1".to_string(), &lines),
            "pg_dump: error: connection refused"
        );
        assert_eq!(
            summarize_failure("exit status 1".to_string(), &[]),
            "exit status 1"
        );
    }

    #[test]
    fn dump_filename_format() {
        let ts = DateTime::parse_from_rfc3339("2025-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(dump_filename("shop", ts), "shop_20250102_030405.sql");
    }

    #[tokio::test]
    async fn checksum_reader_digests_all_bytes() {
        let body: &[u8] = b"backup body bytes";
        let tee = Arc::new(StdMutex::new(ChecksumTee::new()));
        let mut reader = ChecksumReader {
            inner: body,
            tee: Arc::clone(&tee),
        };

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, body);

        let (md5, sha256) = std::mem::take(&mut *tee.lock().unwrap()).finalize();

        let mut expected = ChecksumTee::new();
        expected.update(body);
        assert_eq!((md5, sha256), expected.finalize());
    }

    #[test]
    fn gunzip_round_trip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("dump.sql.gz");
        let out_path = dir.path().join("dump.sql");

        let file = std::fs::File::create(&gz_path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(b"CREATE TABLE t (id int);").unwrap();
        encoder.finish().unwrap();

        gunzip_file(&gz_path, &out_path).unwrap();
        assert_eq!(
            std::fs::read(&out_path).unwrap(),
            b"CREATE TABLE t (id int);"
        );
    }

    async fn service_for_test() -> (Arc<BackupService>, Arc<keel_database::DbConnection>, tempfile::TempDir) {
        let test_db = TestDatabase::with_migrations().await.unwrap();
        let db = test_db.connection_arc();
        let encryption = Arc::new(keel_core::EncryptionService::new_from_password("test"));
        let registry = Arc::new(ConnectionRegistry::new(db.clone(), encryption.clone()));
        let repo = Arc::new(BackupRepository::new(db.clone()));
        let providers = Arc::new(S3ProviderService::new(db.clone(), encryption));
        let log_bus = LogBus::new(Arc::clone(&repo));
        let root = tempfile::tempdir().unwrap();
        let service = BackupService::new(
            registry,
            root.path().to_path_buf(),
            repo,
            providers,
            log_bus,
            Arc::new(NoopNotifier),
        );
        (service, db, root)
    }

    #[tokio::test]
    async fn cancel_without_active_run_is_not_found() {
        let (service, _db, _root) = service_for_test().await;
        assert!(matches!(
            service.cancel_backup(Uuid::new_v4()),
            Err(BackupError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_subprocess_stops_a_running_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let started = std::time::Instant::now();
        terminate_subprocess(&mut child).await;
        // SIGTERM ends sleep well before the kill grace elapses
        assert!(started.elapsed() < TERMINATE_GRACE);

        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn start_backup_rejects_unknown_connection() {
        let (service, _db, _root) = service_for_test().await;
        let err = Arc::clone(&service)
            .start_backup(Uuid::new_v4(), Vec::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
    }

    #[tokio::test]
    async fn start_backup_returns_in_progress_row_with_log_channel() {
        use crate::services::repository::tests::seed_connection;
        use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait};

        let (service, db, _root) = service_for_test().await;

        // seed_connection stores a plaintext password; re-encrypt it so
        // the registry can decrypt.
        let encryption = keel_core::EncryptionService::new_from_password("test");
        let connection_id = seed_connection(&db, Uuid::new_v4()).await;
        let stored = keel_entities::connections::Entity::find_by_id(connection_id)
            .one(db.as_ref())
            .await
            .unwrap()
            .unwrap();
        let mut active: keel_entities::connections::ActiveModel = stored.into();
        active.password = Set(encryption.encrypt_string("pw").unwrap());
        active.update(db.as_ref()).await.unwrap();

        let backup = Arc::clone(&service)
            .start_backup(connection_id, Vec::new(), None)
            .await
            .unwrap();

        assert_eq!(backup.status, backups::STATUS_IN_PROGRESS);
        assert!(backup.path.ends_with(".sql"));
        assert!(backup.path.contains("pg_prod"));

        // The row is durable and the live channel exists before return.
        let stored = service.repo().get_backup(backup.id).await.unwrap();
        assert_eq!(stored.status, backups::STATUS_IN_PROGRESS);
        assert!(service.log_bus().has_channel(backup.id));
    }
}
