pub mod backup;
pub mod driver;
pub mod error;
pub mod log_bus;
pub mod notify;
pub mod providers;
pub mod registry;
pub mod repository;
pub mod scheduler;
pub mod share;
pub mod tunnel;

pub use backup::BackupService;
pub use error::BackupError;
pub use log_bus::LogBus;
pub use providers::S3ProviderService;
pub use registry::{ConnectionRegistry, ResolvedConnection};
pub use repository::BackupRepository;
pub use scheduler::ScheduleManager;
pub use share::ShareTokenService;
