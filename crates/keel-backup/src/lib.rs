//! Backup execution engine.
//!
//! The coordinator drives one backup end to end: dump subprocess, optional
//! SSH tunnel, checksum tee, gzip, fan-out to N object stores, live +
//! durable log multiplexing, terminal status bookkeeping and notification.

pub mod handlers;
pub mod services;

pub use handlers::{configure_routes, AppState};
pub use services::*;
