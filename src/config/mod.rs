//! Configuration management
//!
//! Loading, validation and CLI overriding of the slave's TOML
//! configuration. Every section has full defaults so the slave can run
//! from an empty file during bring-up.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod types;

pub use types::{
    AuthConfig, AutologinConfig, ChooserConfig, DaemonConfig, GreeterConfig, LoggingConfig,
    SecurityConfig, ServerConfig, SessionConfig,
};

use crate::auth::AuthPolicy;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon paths.
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Login policy.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Backend selection.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Greeter commands.
    #[serde(default)]
    pub greeter: GreeterConfig,
    /// Automatic logins.
    #[serde(default)]
    pub autologin: AutologinConfig,
    /// Session execution.
    #[serde(default)]
    pub session: SessionConfig,
    /// X server management.
    #[serde(default)]
    pub server: ServerConfig,
    /// Chooser and indirect queries.
    #[serde(default)]
    pub chooser: ChooserConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults.
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        match self.auth.backend.as_str() {
            "pam" | "crypt" => {}
            other => anyhow::bail!("Invalid auth backend: {other}"),
        }
        #[cfg(not(feature = "pam-auth"))]
        if self.auth.backend == "pam" {
            anyhow::bail!("auth backend 'pam' unavailable: built without the pam-auth feature");
        }

        if self.autologin.enable && self.autologin.user.is_empty() {
            anyhow::bail!("autologin enabled but no autologin user configured");
        }
        if self.autologin.enable && self.autologin.user == "root" {
            anyhow::bail!("refusing to autologin root");
        }
        if self.autologin.timed_enable {
            if self.autologin.timed_user.is_empty() {
                anyhow::bail!("timed login enabled but no timed user configured");
            }
            if self.autologin.timed_user == "root" {
                anyhow::bail!("refusing timed login as root");
            }
            if self.autologin.timed_delay == 0 {
                anyhow::bail!("timed login delay must be at least 1 second");
            }
        }

        if !self.server.command.contains("{display}") {
            anyhow::bail!("server command must contain the {{display}} placeholder");
        }
        if self.server.max_failures == 0 {
            anyhow::bail!("server max_failures must be at least 1");
        }
        if self.session.command.is_empty() {
            anyhow::bail!("session command must not be empty");
        }
        Ok(())
    }

    /// Apply CLI overrides.
    pub fn with_overrides(mut self, log_level: Option<String>) -> Self {
        if let Some(level) = log_level {
            self.logging.level = level;
        }
        self
    }

    /// Snapshot the authentication policy for the backends.
    pub fn auth_policy(&self) -> AuthPolicy {
        AuthPolicy {
            allow_root: self.security.allow_root,
            allow_remote_root: self.security.allow_remote_root,
            retry_delay: std::time::Duration::from_secs(self.security.retry_delay),
            max_auth_retries: self.security.max_auth_retries,
            password_required: self.security.password_required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.auth.backend, "pam");
        assert_eq!(config.security.max_auth_retries, 3);
        assert!(config.server.command.contains("{display}"));
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.default_session, "default");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [security]
            allow_root = false
            retry_delay = 5

            [autologin]
            timed_enable = true
            timed_user = "kiosk"
            "#,
        )
        .unwrap();
        assert!(!config.security.allow_root);
        assert_eq!(config.security.retry_delay, 5);
        assert_eq!(config.autologin.timed_delay, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_backend_is_rejected() {
        let mut config = Config::default_config();
        config.auth.backend = "ldap".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn root_autologin_is_rejected() {
        let mut config = Config::default_config();
        config.autologin.enable = true;
        config.autologin.user = "root".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn timed_login_without_user_is_rejected() {
        let mut config = Config::default_config();
        config.autologin.timed_enable = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn policy_snapshot_reflects_security_section() {
        let mut config = Config::default_config();
        config.security.allow_root = false;
        config.security.retry_delay = 7;
        let policy = config.auth_policy();
        assert!(!policy.allow_root);
        assert_eq!(policy.retry_delay.as_secs(), 7);
    }
}
