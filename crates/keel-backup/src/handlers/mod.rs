pub(crate) mod backup_handler;
pub(crate) mod provider_handler;
pub(crate) mod types;

pub use backup_handler::configure_routes;
pub use types::{AppState, AuthUser};
