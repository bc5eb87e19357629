use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::info;

use keel_backup::handlers::{configure_routes, AppState};
use keel_backup::services::{
    BackupRepository, BackupService, ConnectionRegistry, LogBus, S3ProviderService,
    ScheduleManager, ShareTokenService,
};
use keel_core::app_settings::SmtpSettings;
use keel_core::EncryptionService;
use keel_database::establish_connection;

use crate::notifiers::{LoggingNotifier, WebhookNotifier};

#[derive(Args)]
pub struct ServeCommand {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080", env = "KEEL_LISTEN_ADDR")]
    listen_addr: String,

    /// Database URL (SQLite)
    #[arg(long, default_value = "sqlite://keel.db?mode=rwc", env = "KEEL_DATABASE_URL")]
    database_url: String,

    /// Staging directory for file-mode backups
    #[arg(long, default_value = "backups", env = "KEEL_BACKUP_DIR")]
    backup_dir: PathBuf,

    /// Master key for secrets at rest (32 bytes or 64 hex chars)
    #[arg(long, env = "KEEL_MASTER_KEY")]
    master_key: String,

    /// Optional webhook receiving terminal backup events
    #[arg(long, env = "KEEL_NOTIFY_WEBHOOK_URL")]
    webhook_url: Option<String>,
}

impl ServeCommand {
    pub async fn run(self) -> anyhow::Result<()> {
        let db = establish_connection(&self.database_url).await?;
        info!("database ready at {}", self.database_url);

        // Environment wins over per-user mail settings; the UI shows
        // these as read-only.
        let smtp = SmtpSettings::default().with_env_overrides();
        if smtp.env_overridden {
            info!(
                host = smtp.host.as_deref().unwrap_or_default(),
                from = smtp.from_address.as_deref().unwrap_or_default(),
                "SMTP settings taken from environment"
            );
        }

        let encryption = Arc::new(EncryptionService::new(&self.master_key)?);

        let registry = Arc::new(ConnectionRegistry::new(db.clone(), encryption.clone()));
        let repo = Arc::new(BackupRepository::new(db.clone()));
        let providers = Arc::new(S3ProviderService::new(db.clone(), encryption));
        let log_bus = LogBus::new(Arc::clone(&repo));
        let share_service = Arc::new(ShareTokenService::new(Arc::clone(&repo)));

        let notifier: Arc<dyn keel_core::notifications::BackupNotifier> = match self.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url)?),
            None => Arc::new(LoggingNotifier),
        };

        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let backup_service = BackupService::new(
            registry,
            self.backup_dir.clone(),
            repo,
            providers,
            log_bus,
            notifier,
        );

        let schedule_manager = ScheduleManager::new(Arc::clone(&backup_service));
        Arc::clone(&schedule_manager).start().await;

        let state = AppState {
            backup_service,
            schedule_manager,
            share_service,
        };

        let app = axum::Router::new().nest("/api", configure_routes(state));

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        info!("listening on {}", self.listen_addr);
        axum::serve(listener, app).await?;
        Ok(())
    }
}
