//! Authentication backends
//!
//! The slave verifies credentials through the [`AuthBackend`] trait. Two
//! implementations exist: a PAM backend (full session/credential life
//! cycle, default) and a crypt/shadow backend (plain hash comparison).
//! Which one runs is a configuration decision; the orchestrator only sees
//! the trait.

pub mod conv;
pub mod crypt;
#[cfg(feature = "pam-auth")]
pub mod pam;

use std::time::Duration;

use thiserror::Error;

pub use conv::{Converse, ConverseError, GreeterConverse, NullConverse};

/// Why a verification attempt failed.
///
/// Every variant maps to a distinct greeter-visible message, chosen so
/// that credential failures never reveal whether the username or the
/// password was the wrong half.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// No such user. Surfaced to the user as a generic failure.
    #[error("user unknown")]
    UserUnknown,
    /// Bad credentials.
    #[error("authentication failed")]
    AuthFailed,
    /// The account is expired or disabled.
    #[error("account expired")]
    AccountExpired,
    /// Access denied for now (time restrictions, lockout).
    #[error("permission denied")]
    PermDenied,
    /// Establishing credentials failed.
    #[error("credential setup failed")]
    CredentialSetup,
    /// Opening the backend session failed.
    #[error("session open failed")]
    SessionOpen,
    /// Authentication succeeded but root may not log in here.
    #[error("root login disallowed on this display")]
    RootLoginDisallowed,
    /// Supplementary group setup failed.
    #[error("user group setup failed")]
    GroupSetup,
    /// The conversation was interrupted (greeter event or death).
    #[error("conversation interrupted")]
    Interrupted,
    /// Backend-internal failure; admin-facing detail in the payload.
    #[error("authentication internal error: {0}")]
    Internal(String),
}

impl VerifyError {
    /// The text shown to the user for this failure.
    ///
    /// `asked_password` selects between the "incorrect username or
    /// password" wording and the blander variant used when no password
    /// prompt ever happened.
    pub fn user_message(&self, asked_password: bool) -> &'static str {
        match self {
            VerifyError::UserUnknown | VerifyError::AuthFailed => {
                if asked_password {
                    "\nIncorrect username or password. Letters must be typed in the correct case."
                } else {
                    "\nAuthentication failed. Letters must be typed in the correct case."
                }
            }
            VerifyError::AccountExpired => "\nThe system administrator has disabled your account.",
            VerifyError::PermDenied => {
                "\nThe system administrator has disabled access to the system temporarily."
            }
            VerifyError::CredentialSetup | VerifyError::GroupSetup => {
                "\nCannot set your user group; you will not be able to log in. Please contact your system administrator."
            }
            VerifyError::SessionOpen => {
                "\nCould not start your session. Please contact your system administrator."
            }
            VerifyError::RootLoginDisallowed => {
                "\nThe system administrator is not allowed to login from this screen"
            }
            VerifyError::Interrupted => "",
            VerifyError::Internal(_) => "\nAuthentication failed",
        }
    }
}

/// Mutable policy snapshot the backends consult.
///
/// Owned by the orchestrator and refreshed when the daemon pushes key
/// changes, so a hot-reloaded `AllowRoot` applies to the next attempt
/// without restarting the slave.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    /// Allow uid 0 to log in on attached displays.
    pub allow_root: bool,
    /// Allow uid 0 to log in on remote displays.
    pub allow_remote_root: bool,
    /// Pause after a failed attempt.
    pub retry_delay: Duration,
    /// Failed attempts before the remembered username is dropped.
    pub max_auth_retries: u32,
    /// Refuse empty passwords.
    pub password_required: bool,
}

impl AuthPolicy {
    /// Whether root may complete a login in this context. Consulted only
    /// after credentials verified; rejecting earlier would reveal whether
    /// the root password was correct.
    pub fn root_login_allowed(&self, local: bool) -> bool {
        self.allow_root && (local || self.allow_remote_root)
    }
}

/// What the backend needs to know about the display being authenticated.
#[derive(Debug, Clone)]
pub struct AuthTarget {
    /// Display name, e.g. `:0`.
    pub display: String,
    /// Remote hostname for XDMCP displays.
    pub hostname: Option<String>,
}

/// A pluggable credential verifier.
///
/// At most one backend session is live per slave at any time; a failed
/// `verify_user` leaves the backend exactly as it was before the call,
/// and `cleanup` is idempotent on every path.
pub trait AuthBackend {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Run one full verification attempt.
    ///
    /// With `username: None` the backend asks through `conv`. On success
    /// the backend session (where the backend has one) is left open for
    /// the upcoming user session and the canonical login name returned.
    fn verify_user(
        &mut self,
        conv: &mut dyn Converse,
        username: Option<&str>,
        target: &AuthTarget,
        local: bool,
    ) -> Result<String, VerifyError>;

    /// Open a session for an autologin/timed-login user without prompting.
    fn setup_autologin_session(
        &mut self,
        conv: &mut dyn Converse,
        username: &str,
        target: &AuthTarget,
    ) -> Result<String, VerifyError>;

    /// Environment the open backend session wants exported to the user
    /// session child.
    fn session_env(&self) -> Vec<(String, String)>;

    /// Tear down whatever subset of session/credential state is live.
    /// Safe to call at any moment, any number of times.
    fn cleanup(&mut self);

    /// Update the policy snapshot.
    fn set_policy(&mut self, policy: AuthPolicy);

    /// Suppress admin-facing failure logging (timed/auto-login probing).
    fn set_quiet(&mut self, quiet: bool);

    /// Whether failure logging is currently suppressed.
    fn quiet_failures(&self) -> bool;
}

/// Instantiate the configured backend.
pub fn create_backend(
    backend: &str,
    policy: AuthPolicy,
    pam_service: &str,
    pam_autologin_service: &str,
) -> anyhow::Result<Box<dyn AuthBackend>> {
    match backend {
        "crypt" => Ok(Box::new(crypt::CryptBackend::new(policy))),
        #[cfg(feature = "pam-auth")]
        "pam" => Ok(Box::new(pam::PamBackend::new(
            policy,
            pam_service.to_string(),
            pam_autologin_service.to_string(),
        ))),
        #[cfg(not(feature = "pam-auth"))]
        "pam" => anyhow::bail!("auth backend 'pam' requested but this build lacks the pam-auth feature"),
        other => anyhow::bail!("unknown auth backend '{other}' (expected 'pam' or 'crypt')"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow_root: bool, allow_remote_root: bool) -> AuthPolicy {
        AuthPolicy {
            allow_root,
            allow_remote_root,
            retry_delay: Duration::from_secs(0),
            max_auth_retries: 3,
            password_required: false,
        }
    }

    #[test]
    fn root_policy_matrix() {
        assert!(policy(true, false).root_login_allowed(true));
        assert!(!policy(true, false).root_login_allowed(false));
        assert!(policy(true, true).root_login_allowed(false));
        assert!(!policy(false, true).root_login_allowed(true));
        assert!(!policy(false, false).root_login_allowed(true));
    }

    #[test]
    fn credential_failures_share_one_generic_message() {
        let unknown = VerifyError::UserUnknown.user_message(true);
        let badpass = VerifyError::AuthFailed.user_message(true);
        assert_eq!(unknown, badpass, "user enumeration via message text");
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = create_backend("kerberos", policy(true, true), "luxdm", "luxdm-autologin");
        assert!(err.is_err());
    }
}
