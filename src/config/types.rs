//! Configuration section types
//!
//! One struct per TOML section, serde defaults throughout so a partial
//! file (or none at all) still yields a runnable configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// `[daemon]` - paths shared with the parent daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Daemon command FIFO all slaves write to.
    #[serde(default = "default_fifo_path")]
    pub fifo_path: PathBuf,
    /// Directory for this slave's private notify FIFO.
    #[serde(default = "default_notify_dir")]
    pub notify_dir: PathBuf,
    /// Directory for server authority files.
    #[serde(default = "default_auth_dir")]
    pub auth_dir: PathBuf,
    /// Fallback directory for user authority files when the home
    /// directory cannot hold one.
    #[serde(default = "default_user_auth_fallback")]
    pub user_auth_fallback_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            fifo_path: default_fifo_path(),
            notify_dir: default_notify_dir(),
            auth_dir: default_auth_dir(),
            user_auth_fallback_dir: default_user_auth_fallback(),
        }
    }
}

fn default_fifo_path() -> PathBuf {
    PathBuf::from("/var/run/luxdm/.luxdm_fifo")
}

fn default_notify_dir() -> PathBuf {
    PathBuf::from("/var/run/luxdm")
}

fn default_auth_dir() -> PathBuf {
    PathBuf::from("/var/lib/luxdm/authdir")
}

fn default_user_auth_fallback() -> PathBuf {
    PathBuf::from("/var/lib/luxdm/userauth")
}

/// `[security]` - login policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Allow root logins on attached displays.
    #[serde(default = "default_true")]
    pub allow_root: bool,
    /// Allow root logins on remote displays.
    #[serde(default)]
    pub allow_remote_root: bool,
    /// Seconds to wait after a failed attempt.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Failed attempts before the remembered username is dropped.
    #[serde(default = "default_max_retries")]
    pub max_auth_retries: u32,
    /// Refuse empty passwords.
    #[serde(default)]
    pub password_required: bool,
    /// Allow the greeter's configurator entry.
    #[serde(default)]
    pub configurator_enabled: bool,
    /// Configurator command, run as root after a fresh root check.
    #[serde(default = "default_configurator")]
    pub configurator_command: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allow_root: true,
            allow_remote_root: false,
            retry_delay: default_retry_delay(),
            max_auth_retries: default_max_retries(),
            password_required: false,
            configurator_enabled: false,
            configurator_command: default_configurator(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_delay() -> u64 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_configurator() -> String {
    "/usr/sbin/luxdm-setup".to_string()
}

/// `[auth]` - backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// `pam` or `crypt`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// PAM service for interactive logins.
    #[serde(default = "default_pam_service")]
    pub pam_service: String,
    /// PAM service for autologin and timed login.
    #[serde(default = "default_pam_autologin_service")]
    pub pam_autologin_service: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            pam_service: default_pam_service(),
            pam_autologin_service: default_pam_autologin_service(),
        }
    }
}

fn default_backend() -> String {
    "pam".to_string()
}

fn default_pam_service() -> String {
    "luxdm".to_string()
}

fn default_pam_autologin_service() -> String {
    "luxdm-autologin".to_string()
}

/// `[greeter]` - login UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeterConfig {
    /// Greeter binary for attached displays.
    #[serde(default = "default_greeter")]
    pub command: String,
    /// Greeter binary for remote displays.
    #[serde(default = "default_remote_greeter")]
    pub remote_command: String,
}

impl Default for GreeterConfig {
    fn default() -> Self {
        Self { command: default_greeter(), remote_command: default_remote_greeter() }
    }
}

fn default_greeter() -> String {
    "/usr/libexec/luxdm-greeter".to_string()
}

fn default_remote_greeter() -> String {
    "/usr/libexec/luxdm-greeter".to_string()
}

/// `[autologin]` - automatic and timed logins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutologinConfig {
    /// Log the configured user in on the first managed display without
    /// showing the greeter. Consumed once per daemon lifetime.
    #[serde(default)]
    pub enable: bool,
    /// Autologin user.
    #[serde(default)]
    pub user: String,
    /// Enable the timed-login countdown in the greeter.
    #[serde(default)]
    pub timed_enable: bool,
    /// Timed-login user.
    #[serde(default)]
    pub timed_user: String,
    /// Countdown seconds before the timed login fires.
    #[serde(default = "default_timed_delay")]
    pub timed_delay: u32,
    /// Permit timed login on remote displays.
    #[serde(default)]
    pub allow_remote: bool,
}

impl Default for AutologinConfig {
    fn default() -> Self {
        Self {
            enable: false,
            user: String::new(),
            timed_enable: false,
            timed_user: String::new(),
            timed_delay: default_timed_delay(),
            allow_remote: false,
        }
    }
}

fn default_timed_delay() -> u32 {
    30
}

/// `[session]` - user session execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session launcher script; receives the session name as argument.
    #[serde(default = "default_session_command")]
    pub command: String,
    /// Fallback session when the launcher is broken.
    #[serde(default = "default_failsafe")]
    pub failsafe_command: String,
    /// Default session name handed to the launcher.
    #[serde(default = "default_session_name")]
    pub default_session: String,
    /// PATH exported to sessions.
    #[serde(default = "default_session_path")]
    pub default_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: default_session_command(),
            failsafe_command: default_failsafe(),
            default_session: default_session_name(),
            default_path: default_session_path(),
        }
    }
}

fn default_session_command() -> String {
    "/etc/luxdm/Xsession".to_string()
}

fn default_failsafe() -> String {
    "/usr/bin/xterm -geometry 80x24+0+0".to_string()
}

fn default_session_name() -> String {
    "default".to_string()
}

fn default_session_path() -> String {
    "/usr/local/bin:/usr/bin:/bin:/usr/local/sbin:/usr/sbin:/sbin".to_string()
}

/// `[server]` - X server management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server command; `{display}` and `{authfile}` are substituted.
    #[serde(default = "default_server_command")]
    pub command: String,
    /// Seconds to wait for the server's readiness signal.
    #[serde(default = "default_server_timeout")]
    pub timeout: u64,
    /// Consecutive failures inside the window before the display is
    /// abandoned.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Failure window in seconds.
    #[serde(default = "default_failure_window")]
    pub failure_window: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: default_server_command(),
            timeout: default_server_timeout(),
            max_failures: default_max_failures(),
            failure_window: default_failure_window(),
        }
    }
}

fn default_server_command() -> String {
    "/usr/bin/X {display} -auth {authfile}".to_string()
}

fn default_server_timeout() -> u64 {
    10
}

fn default_max_failures() -> u32 {
    3
}

fn default_failure_window() -> u64 {
    90
}

/// `[chooser]` - remote host chooser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChooserConfig {
    /// Chooser binary.
    #[serde(default = "default_chooser")]
    pub command: String,
    /// Ceiling on pending indirect queries.
    #[serde(default = "default_max_indirect")]
    pub max_indirect: usize,
    /// Seconds an indirect record stays alive without activity.
    #[serde(default = "default_indirect_timeout")]
    pub indirect_timeout: u64,
}

impl Default for ChooserConfig {
    fn default() -> Self {
        Self {
            command: default_chooser(),
            max_indirect: default_max_indirect(),
            indirect_timeout: default_indirect_timeout(),
        }
    }
}

fn default_chooser() -> String {
    "/usr/libexec/luxdm-chooser".to_string()
}

fn default_max_indirect() -> usize {
    16
}

fn default_indirect_timeout() -> u64 {
    900
}

/// `[logging]` - log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional directory for per-display log files.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), log_dir: None }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
