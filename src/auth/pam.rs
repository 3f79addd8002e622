//! PAM authentication backend
//!
//! Drives the full PAM life cycle against raw libpam bindings:
//!
//! ```text
//! pam_start -> pam_authenticate -> root policy -> pam_acct_mgmt
//!   [-> pam_chauthtok on expired tokens]
//!   -> pam_setcred(ESTABLISH) -> pam_open_session
//! ```
//!
//! Two flags, `did_setcred` and `opened_session`, are the only source of
//! truth for what cleanup has to undo. They are set immediately before
//! the call that establishes the state they describe and cleared the
//! moment that call fails, so a cleanup invoked at any point undoes
//! exactly what was actually established. A leaked credential state in a
//! root process is the worst failure mode this module has to prevent.
//!
//! Prompts raised by PAM modules are routed through the [`Converse`]
//! seam; an interrupted conversation surfaces as `PAM_CONV_ERR` and
//! unwinds the whole attempt.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use tracing::{debug, error, info};
use zeroize::Zeroize;

use super::conv::Converse;
use super::{AuthBackend, AuthPolicy, AuthTarget, VerifyError};
use crate::common::signals::{BlockClass, SignalBlock};

/// PAM constants (from `<security/pam_appl.h>`, Linux-PAM numbering)
const PAM_SUCCESS: c_int = 0;
const PAM_PERM_DENIED: c_int = 6;
const PAM_MAXTRIES: c_int = 11;
const PAM_NEW_AUTHTOK_REQD: c_int = 12;
const PAM_ACCT_EXPIRED: c_int = 13;
const PAM_USER_UNKNOWN: c_int = 10;
const PAM_BUF_ERR: c_int = 5;
const PAM_CONV_ERR: c_int = 19;

const PAM_PROMPT_ECHO_OFF: c_int = 1;
const PAM_PROMPT_ECHO_ON: c_int = 2;
const PAM_ERROR_MSG: c_int = 3;
const PAM_TEXT_INFO: c_int = 4;

const PAM_USER: c_int = 2;
const PAM_TTY: c_int = 3;
const PAM_RHOST: c_int = 4;
const PAM_CONV: c_int = 5;
const PAM_USER_PROMPT: c_int = 9;

const PAM_DISALLOW_NULL_AUTHTOK: c_int = 0x1;
const PAM_ESTABLISH_CRED: c_int = 0x2;
const PAM_DELETE_CRED: c_int = 0x4;
const PAM_CHANGE_EXPIRED_AUTHTOK: c_int = 0x20;

#[repr(C)]
struct PamMessage {
    msg_style: c_int,
    msg: *const c_char,
}

#[repr(C)]
struct PamResponse {
    resp: *mut c_char,
    resp_retcode: c_int,
}

#[repr(C)]
struct PamConv {
    conv: extern "C" fn(
        num_msg: c_int,
        msg: *mut *const PamMessage,
        resp: *mut *mut PamResponse,
        appdata_ptr: *mut c_void,
    ) -> c_int,
    appdata_ptr: *mut c_void,
}

#[link(name = "pam")]
extern "C" {
    fn pam_start(
        service_name: *const c_char,
        user: *const c_char,
        pam_conversation: *const PamConv,
        pamh: *mut *mut c_void,
    ) -> c_int;
    fn pam_end(pamh: *mut c_void, pam_status: c_int) -> c_int;
    fn pam_authenticate(pamh: *mut c_void, flags: c_int) -> c_int;
    fn pam_acct_mgmt(pamh: *mut c_void, flags: c_int) -> c_int;
    fn pam_chauthtok(pamh: *mut c_void, flags: c_int) -> c_int;
    fn pam_setcred(pamh: *mut c_void, flags: c_int) -> c_int;
    fn pam_open_session(pamh: *mut c_void, flags: c_int) -> c_int;
    fn pam_close_session(pamh: *mut c_void, flags: c_int) -> c_int;
    fn pam_get_item(pamh: *const c_void, item_type: c_int, item: *mut *const c_void) -> c_int;
    fn pam_set_item(pamh: *mut c_void, item_type: c_int, item: *const c_void) -> c_int;
    fn pam_strerror(pamh: *mut c_void, errnum: c_int) -> *const c_char;
    fn pam_getenvlist(pamh: *mut c_void) -> *mut *mut c_char;
}

/// State shared with the conversation callback for the duration of the
/// PAM calls of one attempt.
struct ConvState<'a> {
    conv: &'a mut dyn Converse,
    asked_password: bool,
    interrupted: bool,
}

fn wipe_cstring(s: CString) {
    let mut bytes = s.into_bytes_with_nul();
    bytes.zeroize();
}

/// Free the first `upto` responses plus the array itself, scrubbing any
/// answer bytes (they may hold a password) before releasing them.
unsafe fn free_responses(responses: *mut PamResponse, upto: isize) {
    for i in 0..upto {
        let resp = unsafe { (*responses.offset(i)).resp };
        if !resp.is_null() {
            unsafe {
                let len = libc::strlen(resp);
                ptr::write_bytes(resp, 0, len);
                libc::free(resp.cast());
            }
        }
    }
    unsafe { libc::free(responses.cast()) };
}

/// The PAM conversation callback. Uses the Linux convention: `msg` points
/// at an array of message structs.
extern "C" fn conversation(
    num_msg: c_int,
    msg: *mut *const PamMessage,
    resp: *mut *mut PamResponse,
    appdata_ptr: *mut c_void,
) -> c_int {
    if num_msg <= 0 || msg.is_null() || resp.is_null() || appdata_ptr.is_null() {
        return PAM_CONV_ERR;
    }
    unsafe {
        let state = &mut *(appdata_ptr as *mut ConvState<'_>);
        let responses =
            libc::calloc(num_msg as usize, std::mem::size_of::<PamResponse>()) as *mut PamResponse;
        if responses.is_null() {
            return PAM_BUF_ERR;
        }

        let messages = *msg;
        for i in 0..num_msg as isize {
            let message = &*messages.offset(i);
            let text = if message.msg.is_null() {
                String::new()
            } else {
                CStr::from_ptr(message.msg).to_string_lossy().into_owned()
            };

            let answer = match message.msg_style {
                PAM_PROMPT_ECHO_ON => match state.conv.prompt_echo_on(&text) {
                    Ok(ans) => Some(ans),
                    Err(_) => {
                        state.interrupted = true;
                        free_responses(responses, i);
                        return PAM_CONV_ERR;
                    }
                },
                PAM_PROMPT_ECHO_OFF => {
                    state.asked_password = true;
                    match state.conv.prompt_echo_off(&text) {
                        Ok(ans) => Some(ans),
                        Err(_) => {
                            state.interrupted = true;
                            free_responses(responses, i);
                            return PAM_CONV_ERR;
                        }
                    }
                }
                PAM_ERROR_MSG => {
                    state.conv.error_box(&text);
                    None
                }
                PAM_TEXT_INFO => {
                    state.conv.info(&text);
                    None
                }
                _ => {
                    free_responses(responses, i);
                    return PAM_CONV_ERR;
                }
            };

            match answer {
                Some(ans) => {
                    let c = match CString::new(ans) {
                        Ok(c) => c,
                        Err(_) => {
                            free_responses(responses, i);
                            return PAM_CONV_ERR;
                        }
                    };
                    let dup = libc::strdup(c.as_ptr());
                    wipe_cstring(c);
                    if dup.is_null() {
                        free_responses(responses, i);
                        return PAM_BUF_ERR;
                    }
                    (*responses.offset(i)).resp = dup;
                }
                None => {
                    (*responses.offset(i)).resp = ptr::null_mut();
                }
            }
            (*responses.offset(i)).resp_retcode = 0;
        }

        *resp = responses;
        PAM_SUCCESS
    }
}

/// The PAM backend. At most one PAM context is live at a time.
pub struct PamBackend {
    policy: AuthPolicy,
    service: String,
    autologin_service: String,
    handle: *mut c_void,
    did_setcred: bool,
    opened_session: bool,
    prev_user: Option<String>,
    auth_retries: u32,
    quiet: bool,
}

impl PamBackend {
    /// New backend for the given PAM service names.
    pub fn new(policy: AuthPolicy, service: String, autologin_service: String) -> Self {
        Self {
            policy,
            service,
            autologin_service,
            handle: ptr::null_mut(),
            did_setcred: false,
            opened_session: false,
            prev_user: None,
            auth_retries: 0,
            quiet: false,
        }
    }

    fn strerror(&self, code: c_int) -> String {
        unsafe {
            let msg = pam_strerror(self.handle, code);
            if msg.is_null() {
                format!("PAM error {code}")
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            }
        }
    }

    /// Create the PAM context. Any previous context is torn down first so
    /// the single-live-context invariant holds even on repeated calls.
    fn start_context(
        &mut self,
        service: &str,
        user: Option<&str>,
        conv: *const PamConv,
        target: &AuthTarget,
    ) -> Result<(), VerifyError> {
        self.cleanup();

        let service = CString::new(service)
            .map_err(|_| VerifyError::Internal("service name contains NUL".into()))?;
        let user_c = match user {
            Some(u) => {
                Some(CString::new(u).map_err(|_| VerifyError::Internal("login contains NUL".into()))?)
            }
            None => None,
        };

        let mut handle: *mut c_void = ptr::null_mut();
        let rc = unsafe {
            pam_start(
                service.as_ptr(),
                user_c.as_ref().map_or(ptr::null(), |u| u.as_ptr()),
                conv,
                &mut handle,
            )
        };
        if rc != PAM_SUCCESS {
            error!(rc, "pam_start failed");
            return Err(VerifyError::Internal(format!("pam_start failed with {rc}")));
        }
        self.handle = handle;

        if let Ok(tty) = CString::new(target.display.as_str()) {
            unsafe {
                pam_set_item(self.handle, PAM_TTY, tty.as_ptr().cast());
            }
        }
        if let Some(host) = &target.hostname {
            if let Ok(rhost) = CString::new(host.as_str()) {
                unsafe {
                    pam_set_item(self.handle, PAM_RHOST, rhost.as_ptr().cast());
                }
            }
        }
        if let Ok(prompt) = CString::new("Username:") {
            unsafe {
                pam_set_item(self.handle, PAM_USER_PROMPT, prompt.as_ptr().cast());
            }
        }
        Ok(())
    }

    /// Canonical login name after authentication, from `PAM_USER`.
    fn authenticated_user(&self) -> Option<String> {
        let mut item: *const c_void = ptr::null();
        let rc = unsafe { pam_get_item(self.handle, PAM_USER, &mut item) };
        if rc != PAM_SUCCESS || item.is_null() {
            return None;
        }
        unsafe { Some(CStr::from_ptr(item.cast()).to_string_lossy().into_owned()) }
    }

    /// Replace the conversation's appdata with a null pointer once the
    /// interactive part of an attempt is over. The callback rejects null
    /// appdata, so a module conversing during `pam_close_session` gets a
    /// clean `PAM_CONV_ERR` instead of following a dangling pointer into
    /// a long-gone stack frame.
    fn neutralize_conversation(&self) {
        if self.handle.is_null() {
            return;
        }
        let conv = PamConv { conv: conversation, appdata_ptr: ptr::null_mut() };
        unsafe {
            pam_set_item(self.handle, PAM_CONV, (&conv as *const PamConv).cast());
        }
    }

    fn auth_flags(&self) -> c_int {
        if self.policy.password_required {
            PAM_DISALLOW_NULL_AUTHTOK
        } else {
            0
        }
    }

    fn fail_delay(&self) {
        if !self.policy.retry_delay.is_zero() {
            std::thread::sleep(self.policy.retry_delay);
        }
    }

    /// Account management plus the expired-token change sub-step.
    fn check_account(&mut self, conv: &mut dyn Converse, login: &str) -> Result<(), VerifyError> {
        let rc = unsafe { pam_acct_mgmt(self.handle, self.auth_flags()) };
        match rc {
            PAM_SUCCESS => Ok(()),
            PAM_NEW_AUTHTOK_REQD => {
                let rc = unsafe { pam_chauthtok(self.handle, PAM_CHANGE_EXPIRED_AUTHTOK) };
                if rc != PAM_SUCCESS {
                    error!(login, detail = %self.strerror(rc), "authentication token change failed");
                    conv.error_box(
                        "\nThe change of the authentication token failed. Please try again later or contact the system administrator.",
                    );
                    return Err(VerifyError::PermDenied);
                }
                Ok(())
            }
            PAM_ACCT_EXPIRED => {
                error!(login, "user no longer permitted to access the system");
                conv.error_box(VerifyError::AccountExpired.user_message(true));
                Err(VerifyError::AccountExpired)
            }
            PAM_PERM_DENIED => {
                error!(login, "user not permitted to gain access at this time");
                conv.error_box(VerifyError::PermDenied.user_message(true));
                Err(VerifyError::PermDenied)
            }
            rc => {
                if !self.quiet {
                    error!(login, detail = %self.strerror(rc), "account management failed");
                }
                Err(VerifyError::Internal(self.strerror(rc)))
            }
        }
    }

    /// Establish credentials and open the PAM session, maintaining the
    /// idempotency flags at every step.
    fn establish_and_open(&mut self, login: &str) -> Result<(), VerifyError> {
        self.did_setcred = true;
        let rc = unsafe { pam_setcred(self.handle, PAM_ESTABLISH_CRED) };
        if rc != PAM_SUCCESS {
            self.did_setcred = false;
            if !self.quiet {
                error!(login, detail = %self.strerror(rc), "could not set credentials");
            }
            return Err(VerifyError::CredentialSetup);
        }

        self.opened_session = true;
        let rc = unsafe { pam_open_session(self.handle, 0) };
        if rc != PAM_SUCCESS {
            self.opened_session = false;
            // Cleanup handles the credential rollback through the flag.
            if !self.quiet {
                error!(login, detail = %self.strerror(rc), "could not open session");
            }
            return Err(VerifyError::SessionOpen);
        }
        Ok(())
    }

    fn track_retry(&mut self, rc: c_int, login: Option<&str>) {
        match login {
            Some(login) if self.prev_user.as_deref() == Some(login) => {}
            Some(login) => {
                self.prev_user = Some(login.to_string());
                self.auth_retries = 0;
            }
            None => {}
        }
        self.auth_retries += 1;
        if rc == PAM_MAXTRIES || self.auth_retries >= self.policy.max_auth_retries {
            self.prev_user = None;
            self.auth_retries = 0;
        }
    }

    fn report_failure(
        &self,
        conv: &mut dyn Converse,
        err: &VerifyError,
        asked_password: bool,
    ) {
        let msg = err.user_message(asked_password);
        if !msg.is_empty() {
            conv.error_box(msg);
        }
    }
}

impl AuthBackend for PamBackend {
    fn name(&self) -> &'static str {
        "pam"
    }

    fn verify_user(
        &mut self,
        conv: &mut dyn Converse,
        username: Option<&str>,
        target: &AuthTarget,
        local: bool,
    ) -> Result<String, VerifyError> {
        conv.start_timer();

        let preset: Option<String> =
            username.map(str::to_string).or_else(|| self.prev_user.clone());
        if let Some(user) = &preset {
            conv.set_login(user);
        }

        let mut state = ConvState { conv, asked_password: false, interrupted: false };
        let pam_conv =
            PamConv { conv: conversation, appdata_ptr: (&mut state as *mut ConvState<'_>).cast() };

        if let Err(err) = self.start_context(&self.service.clone(), preset.as_deref(), &pam_conv, target)
        {
            state.conv.stop_timer();
            return Err(err);
        }

        let rc = unsafe { pam_authenticate(self.handle, self.auth_flags()) };
        state.conv.stop_timer();
        let asked_password = state.asked_password;

        if rc != PAM_SUCCESS {
            let interrupted = state.interrupted;
            let login = self.authenticated_user();
            self.cleanup();
            if interrupted {
                return Err(VerifyError::Interrupted);
            }
            if !self.quiet {
                error!(detail = %self.strerror(rc), "couldn't authenticate user");
            }
            self.track_retry(rc, login.as_deref());
            self.fail_delay();
            let err = match rc {
                PAM_USER_UNKNOWN => VerifyError::UserUnknown,
                _ => VerifyError::AuthFailed,
            };
            self.report_failure(state.conv, &err, asked_password);
            return Err(err);
        }

        let Some(login) = self.authenticated_user() else {
            self.cleanup();
            if !self.quiet {
                error!("couldn't authenticate user: no PAM_USER after success");
            }
            let err = VerifyError::Internal("no PAM_USER item".into());
            self.report_failure(state.conv, &VerifyError::AuthFailed, asked_password);
            return Err(err);
        };
        state.conv.set_login(&login);

        // Root policy runs only now, after the credential check, so a
        // wrong root password reports the same generic failure as any
        // other wrong password.
        let pwent = nix::unistd::User::from_name(&login).ok().flatten();
        if let Some(user) = &pwent {
            if user.uid.is_root() && !self.policy.root_login_allowed(local) {
                error!(display = %target.display, "root login disallowed on display");
                let err = VerifyError::RootLoginDisallowed;
                self.report_failure(state.conv, &err, asked_password);
                self.cleanup();
                return Err(err);
            }
        }

        if let Err(err) = self.check_account(state.conv, &login) {
            self.cleanup();
            return Err(err);
        }

        if pwent.is_none() {
            error!(login, "cannot set user group");
            self.report_failure(state.conv, &VerifyError::GroupSetup, asked_password);
            self.cleanup();
            return Err(VerifyError::GroupSetup);
        }

        if let Err(err) = self.establish_and_open(&login) {
            self.report_failure(state.conv, &err, asked_password);
            self.cleanup();
            return Err(err);
        }

        self.prev_user = None;
        self.auth_retries = 0;
        self.neutralize_conversation();
        info!(login, "authentication succeeded, session open");
        Ok(login)
    }

    fn setup_autologin_session(
        &mut self,
        conv: &mut dyn Converse,
        username: &str,
        target: &AuthTarget,
    ) -> Result<String, VerifyError> {
        let mut state = ConvState { conv, asked_password: false, interrupted: false };
        let pam_conv =
            PamConv { conv: conversation, appdata_ptr: (&mut state as *mut ConvState<'_>).cast() };

        self.start_context(&self.autologin_service.clone(), Some(username), &pam_conv, target)?;

        // The autologin stack is expected not to prompt; a module that
        // insists on input fails the whole setup through the null
        // conversation.
        let rc = unsafe { pam_authenticate(self.handle, 0) };
        if rc != PAM_SUCCESS {
            if !self.quiet {
                error!(username, detail = %self.strerror(rc), "autologin authentication failed");
            }
            self.cleanup();
            return Err(VerifyError::AuthFailed);
        }

        let login = self.authenticated_user().unwrap_or_else(|| username.to_string());

        if let Err(err) = self.check_account(state.conv, &login) {
            self.cleanup();
            return Err(err);
        }
        if let Err(err) = self.establish_and_open(&login) {
            self.cleanup();
            return Err(err);
        }

        self.neutralize_conversation();
        info!(login, "autologin session open");
        Ok(login)
    }

    fn session_env(&self) -> Vec<(String, String)> {
        if self.handle.is_null() {
            return Vec::new();
        }
        let mut out = Vec::new();
        unsafe {
            let list = pam_getenvlist(self.handle);
            if list.is_null() {
                return out;
            }
            let mut cursor = list;
            while !(*cursor).is_null() {
                let entry = CStr::from_ptr(*cursor).to_string_lossy();
                if let Some((key, value)) = entry.split_once('=') {
                    out.push((key.to_string(), value.to_string()));
                }
                libc::free((*cursor).cast());
                cursor = cursor.add(1);
            }
            libc::free(list.cast());
        }
        out
    }

    fn cleanup(&mut self) {
        if self.handle.is_null() {
            self.did_setcred = false;
            self.opened_session = false;
            return;
        }

        // Swap the handle out under signal blocks so a child-death or
        // termination arriving mid-teardown can never observe a half
        // valid context.
        let _term = SignalBlock::new(BlockClass::Terminate);
        let _chld = SignalBlock::new(BlockClass::Child);
        let handle = std::mem::replace(&mut self.handle, ptr::null_mut());

        unsafe {
            if self.opened_session {
                pam_close_session(handle, 0);
            }
            if self.did_setcred {
                pam_setcred(handle, PAM_DELETE_CRED);
            }
            pam_end(handle, PAM_SUCCESS);
        }
        self.opened_session = false;
        self.did_setcred = false;
        debug!("pam context closed");
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

impl Drop for PamBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn backend() -> PamBackend {
        PamBackend::new(
            AuthPolicy {
                allow_root: false,
                allow_remote_root: false,
                retry_delay: Duration::from_secs(0),
                max_auth_retries: 3,
                password_required: false,
            },
            "luxdm".into(),
            "luxdm-autologin".into(),
        )
    }

    #[test]
    fn cleanup_without_context_is_a_noop() {
        let mut b = backend();
        b.cleanup();
        b.cleanup();
        assert!(b.handle.is_null());
        assert!(!b.did_setcred);
        assert!(!b.opened_session);
    }

    #[test]
    fn session_env_without_context_is_empty() {
        let b = backend();
        assert!(b.session_env().is_empty());
    }

    #[test]
    fn retry_tracking_resets_after_limit() {
        let mut b = backend();
        b.prev_user = Some("alice".into());
        b.track_retry(7, Some("alice"));
        b.track_retry(7, Some("alice"));
        assert_eq!(b.auth_retries, 2);
        assert_eq!(b.prev_user.as_deref(), Some("alice"));
        b.track_retry(7, Some("alice"));
        assert_eq!(b.prev_user, None, "third failure drops the remembered user");
        assert_eq!(b.auth_retries, 0);
    }

    #[test]
    fn maxtries_drops_remembered_user_immediately() {
        let mut b = backend();
        b.prev_user = Some("alice".into());
        b.track_retry(PAM_MAXTRIES, Some("alice"));
        assert_eq!(b.prev_user, None);
    }

    #[test]
    fn switching_user_resets_the_retry_counter() {
        let mut b = backend();
        b.track_retry(7, Some("alice"));
        assert_eq!(b.auth_retries, 1);
        b.track_retry(7, Some("bob"));
        assert_eq!(b.auth_retries, 1);
        assert_eq!(b.prev_user.as_deref(), Some("bob"));
    }
}
