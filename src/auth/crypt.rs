//! crypt/shadow authentication backend
//!
//! The simple variant: look the user up in passwd/shadow and compare a
//! crypt(3)-style hash. There are no session or credential phases, so
//! `session_env` and `cleanup` are intentionally empty.

use std::ffi::{CStr, CString};

use tracing::{debug, error};
use zeroize::Zeroize;

use super::conv::{Converse, ConverseError};
use super::{AuthBackend, AuthPolicy, AuthTarget, VerifyError};

/// Hash-comparison backend over the system user database.
pub struct CryptBackend {
    policy: AuthPolicy,
    quiet: bool,
}

impl CryptBackend {
    /// New backend with the given policy snapshot.
    pub fn new(policy: AuthPolicy) -> Self {
        Self { policy, quiet: false }
    }

    fn lookup_user(name: &str) -> Option<nix::unistd::User> {
        nix::unistd::User::from_name(name).ok().flatten()
    }

    /// Resolve the stored hash for a user, chasing the shadow file when
    /// the passwd entry only carries the `x` placeholder.
    fn stored_hash(user: &nix::unistd::User) -> Option<String> {
        let pw = user.passwd.to_str().ok()?;
        if pw == "x" || pw == "*shadow*" {
            shadow_hash(&user.name)
        } else {
            Some(pw.to_string())
        }
    }

    fn fail_delay(&self) {
        if !self.policy.retry_delay.is_zero() {
            std::thread::sleep(self.policy.retry_delay);
        }
    }

    fn report(&self, conv: &mut dyn Converse, err: &VerifyError, asked_password: bool, login: &str) {
        if !self.quiet {
            error!(login, %err, "could not authenticate user");
        }
        let msg = err.user_message(asked_password);
        if !msg.is_empty() {
            conv.error_box(msg);
        }
    }
}

/// Read the shadow entry hash for a user. Requires root.
fn shadow_hash(name: &str) -> Option<String> {
    let cname = CString::new(name).ok()?;
    // getspnam returns a pointer into static storage; copy out before any
    // other call can clobber it. Single-threaded process, no _r needed.
    unsafe {
        let sp = libc::getspnam(cname.as_ptr());
        if sp.is_null() {
            return None;
        }
        let pw = (*sp).sp_pwdp;
        if pw.is_null() {
            return None;
        }
        Some(CStr::from_ptr(pw).to_string_lossy().into_owned())
    }
}

/// Compare a candidate password against a stored crypt(3) hash.
///
/// Locked and no-login markers (`!`, `*` prefixes) never verify. An empty
/// stored hash means a passwordless account and only matches an empty
/// password.
pub fn password_matches(password: &str, stored_hash: &str) -> bool {
    if stored_hash.is_empty() {
        return password.is_empty();
    }
    if stored_hash.starts_with('!') || stored_hash.starts_with('*') {
        return false;
    }
    pwhash::unix::verify(password, stored_hash)
}

impl AuthBackend for CryptBackend {
    fn name(&self) -> &'static str {
        "crypt"
    }

    fn verify_user(
        &mut self,
        conv: &mut dyn Converse,
        username: Option<&str>,
        target: &AuthTarget,
        local: bool,
    ) -> Result<String, VerifyError> {
        if local {
            conv.start_timer();
        }

        let login = match username {
            Some(name) => name.to_string(),
            None => {
                conv.info("Please enter your username");
                let answer = conv.prompt_echo_on("Username:");
                conv.info("");
                match answer {
                    Ok(name) if !name.is_empty() => name,
                    Ok(_) | Err(ConverseError::Interrupted) | Err(ConverseError::Unavailable) => {
                        if local {
                            conv.stop_timer();
                        }
                        return Err(VerifyError::Interrupted);
                    }
                }
            }
        };
        conv.set_login(&login);

        let user = Self::lookup_user(&login);
        let stored = user.as_ref().and_then(Self::stored_hash);

        // Always run the password prompt for unknown users too; skipping
        // it would reveal which usernames exist.
        let passwordless = matches!(stored.as_deref(), Some(""));
        let mut password = if passwordless {
            String::new()
        } else {
            match conv.prompt_echo_off("Password:") {
                Ok(pass) => pass,
                Err(_) => {
                    if local {
                        conv.stop_timer();
                    }
                    return Err(VerifyError::Interrupted);
                }
            }
        };

        if local {
            conv.stop_timer();
        }

        let Some(user) = user else {
            password.zeroize();
            self.fail_delay();
            let err = VerifyError::UserUnknown;
            self.report(conv, &err, true, &login);
            return Err(err);
        };

        if self.policy.password_required && password.is_empty() && !passwordless {
            password.zeroize();
            let err = VerifyError::AuthFailed;
            self.report(conv, &err, true, &login);
            return Err(err);
        }

        let hash = stored.unwrap_or_default();
        let ok = password_matches(&password, &hash);
        password.zeroize();
        if !ok {
            self.fail_delay();
            let err = VerifyError::AuthFailed;
            self.report(conv, &err, true, &login);
            return Err(err);
        }

        if user.uid.is_root() && !self.policy.root_login_allowed(local) {
            error!(display = %target.display, "root login disallowed on this display");
            let err = VerifyError::RootLoginDisallowed;
            self.report(conv, &err, true, &login);
            return Err(err);
        }

        debug!(login, "crypt verification succeeded");
        Ok(user.name)
    }

    fn setup_autologin_session(
        &mut self,
        _conv: &mut dyn Converse,
        username: &str,
        _target: &AuthTarget,
    ) -> Result<String, VerifyError> {
        let user = Self::lookup_user(username).ok_or(VerifyError::UserUnknown)?;
        Ok(user.name)
    }

    fn session_env(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn cleanup(&mut self) {
        // Nothing to undo: this backend holds no session state.
    }

    fn set_policy(&mut self, policy: AuthPolicy) {
        self.policy = policy;
    }

    fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    fn quiet_failures(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str =
        "$6$saltstring$q2.778Y7vt0Ij2OIl01VlxEE6SEh8ZCtgFbyJX8fYkl5S7gx32QO24FVg.rs4DkoAs9t6R19x4z8g69teXFxA0";

    #[test]
    fn correct_password_verifies() {
        assert!(password_matches("hunter2", HASH));
    }

    #[test]
    fn wrong_password_fails() {
        assert!(!password_matches("hunter3", HASH));
        assert!(!password_matches("", HASH));
    }

    #[test]
    fn locked_accounts_never_verify() {
        assert!(!password_matches("hunter2", &format!("!{HASH}")));
        assert!(!password_matches("anything", "*"));
        assert!(!password_matches("", "!"));
    }

    #[test]
    fn passwordless_account_accepts_only_empty() {
        assert!(password_matches("", ""));
        assert!(!password_matches("something", ""));
    }
}
