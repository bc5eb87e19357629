//! SMTP settings with environment overrides.
//!
//! When the `SMTP_*` variables are present they win over anything stored
//! per user, and the resolved settings are flagged read-only so the UI can
//! disable the corresponding inputs.

use serde::{Deserialize, Serialize};

pub const SMTP_HOST_ENV: &str = "SMTP_HOST";
pub const SMTP_PORT_ENV: &str = "SMTP_PORT";
pub const SMTP_USER_ENV: &str = "SMTP_USER";
pub const SMTP_PASSWORD_ENV: &str = "SMTP_PASSWORD";
pub const SMTP_FROM_ENV: &str = "SMTP_FROM";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: Option<String>,
    /// True when any value came from the environment; such settings are
    /// reported read-only to the UI.
    pub env_overridden: bool,
}

impl SmtpSettings {
    /// Applies environment overrides on top of stored per-user values.
    pub fn with_env_overrides(mut self) -> Self {
        let mut overridden = false;

        if let Ok(host) = std::env::var(SMTP_HOST_ENV) {
            if !host.is_empty() {
                self.host = Some(host);
                overridden = true;
            }
        }
        if let Ok(port) = std::env::var(SMTP_PORT_ENV) {
            if let Ok(port) = port.parse::<u16>() {
                self.port = Some(port);
                overridden = true;
            }
        }
        if let Ok(user) = std::env::var(SMTP_USER_ENV) {
            if !user.is_empty() {
                self.username = Some(user);
                overridden = true;
            }
        }
        if let Ok(password) = std::env::var(SMTP_PASSWORD_ENV) {
            if !password.is_empty() {
                self.password = Some(password);
                overridden = true;
            }
        }
        if let Ok(from) = std::env::var(SMTP_FROM_ENV) {
            if !from.is_empty() {
                self.from_address = Some(from);
                overridden = true;
            }
        }

        self.env_overridden = overridden;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Process environment is shared; tests touching it take this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_smtp_env() {
        for key in [
            SMTP_HOST_ENV,
            SMTP_PORT_ENV,
            SMTP_USER_ENV,
            SMTP_PASSWORD_ENV,
            SMTP_FROM_ENV,
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn env_values_win_over_stored_ones() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_smtp_env();
        std::env::set_var(SMTP_HOST_ENV, "mail.env.example");
        std::env::set_var(SMTP_PORT_ENV, "2525");
        std::env::set_var(SMTP_FROM_ENV, "backups@env.example");

        let stored = SmtpSettings {
            host: Some("mail.stored.example".to_string()),
            port: Some(587),
            username: Some("stored-user".to_string()),
            password: None,
            from_address: Some("backups@stored.example".to_string()),
            env_overridden: false,
        };

        let resolved = stored.with_env_overrides();
        assert_eq!(resolved.host.as_deref(), Some("mail.env.example"));
        assert_eq!(resolved.port, Some(2525));
        assert_eq!(resolved.from_address.as_deref(), Some("backups@env.example"));
        // Values without an override keep the stored setting
        assert_eq!(resolved.username.as_deref(), Some("stored-user"));
        // Reported read-only to the UI
        assert!(resolved.env_overridden);

        clear_smtp_env();
    }

    #[test]
    fn without_env_stored_values_pass_through() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_smtp_env();

        let stored = SmtpSettings {
            host: Some("mail.stored.example".to_string()),
            port: Some(587),
            username: None,
            password: None,
            from_address: None,
            env_overridden: false,
        };

        let resolved = stored.with_env_overrides();
        assert_eq!(resolved.host.as_deref(), Some("mail.stored.example"));
        assert_eq!(resolved.port, Some(587));
        assert!(!resolved.env_overridden);
    }

    #[test]
    fn empty_and_invalid_env_values_are_ignored() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_smtp_env();
        std::env::set_var(SMTP_HOST_ENV, "");
        std::env::set_var(SMTP_PORT_ENV, "not-a-port");

        let resolved = SmtpSettings::default().with_env_overrides();
        assert!(resolved.host.is_none());
        assert!(resolved.port.is_none());
        assert!(!resolved.env_overridden);

        clear_smtp_env();
    }
}
