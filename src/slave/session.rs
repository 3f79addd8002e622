//! User session execution
//!
//! Forks the session child: close inherited descriptors, drop privileges
//! in the only safe order (groups, then gid, then uid), point stderr at
//! `~/.xsession-errors` and exec the session launcher with a fixed
//! environment. The parent waits and applies the short-session heuristic
//! to distinguish a crash loop from a real logout.

use std::ffi::CString;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use nix::unistd::User;
use tracing::{debug, info, warn};

use crate::slave::child::{ChildHandle, ChildRole};
use crate::slave::display::Display;

/// Sessions that end within this many seconds count as crashed.
const SHORT_SESSION_SECS: u64 = 10;

/// Everything needed to build one session child.
pub struct SessionSpec<'a> {
    /// Resolved target user.
    pub user: &'a User,
    /// Session launcher command line.
    pub command: &'a str,
    /// Session name argument for the launcher.
    pub session_name: &'a str,
    /// Environment from the auth backend (PAM env).
    pub backend_env: &'a [(String, String)],
    /// Language for the session, when one was selected.
    pub lang: Option<&'a str>,
    /// This is the failsafe fallback session.
    pub failsafe: bool,
}

/// A session exiting this fast is treated as a probable crash or broken
/// setup rather than a logout; an instant crash loop would otherwise
/// leave the display flickering forever.
pub fn ended_too_fast(duration: Duration) -> bool {
    duration.as_secs() <= SHORT_SESSION_SECS
}

/// Where the session's stderr capture lives.
pub fn xsession_errors_path(home: &Path) -> PathBuf {
    home.join(".xsession-errors")
}

/// Assemble the fixed environment contract for a session child.
///
/// Starts from a cleared environment; MAIL in particular must never leak
/// in from the slave. Backend (PAM) variables come first so the fixed
/// contract wins any collision.
pub fn build_env(display: &Display, spec: &SessionSpec<'_>, path_default: &str) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    for (key, value) in spec.backend_env {
        if key != "MAIL" {
            env.push((key.clone(), value.clone()));
        }
    }

    let mut put = |key: &str, value: String| {
        env.retain(|(k, _)| k != key);
        env.push((key.to_string(), value));
    };

    put("DISPLAY", display.name.clone());
    if let Some(userauth) = &display.userauth {
        put("XAUTHORITY", userauth.display().to_string());
    }
    put("HOME", spec.user.dir.display().to_string());
    put("PATH", path_default.to_string());
    put("USER", spec.user.name.clone());
    put("USERNAME", spec.user.name.clone());
    put("LOGNAME", spec.user.name.clone());
    put("SHELL", spec.user.shell.display().to_string());
    put("GDMSESSION", spec.session_name.to_string());
    if let Some(lang) = spec.lang {
        put("GDM_LANG", lang.to_string());
        put("LANG", lang.to_string());
    }
    put("RUNNING_UNDER_GDM", "true".to_string());
    env
}

/// Check whether a home directory is usable for the session.
pub fn home_usable(home: &Path) -> bool {
    home.is_dir()
}

/// Spawn the session child.
///
/// The pre-exec hook runs between fork and exec and keeps to
/// async-signal-safe calls: setsid and the privilege drop happen there,
/// and stderr is redirected to `.xsession-errors` only after the child
/// already runs as the target user.
pub fn spawn(display: &Display, spec: &SessionSpec<'_>, path_default: &str, home: &Path) -> io::Result<ChildHandle> {
    let mut argv: Vec<String> = spec.command.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty session command"));
    }
    if !spec.failsafe {
        argv.push(spec.session_name.to_string());
    }

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.env_clear();
    for (key, value) in build_env(display, spec, path_default) {
        cmd.env(key, value);
    }

    let uid = spec.user.uid.as_raw();
    let gid = spec.user.gid.as_raw();
    let username = CString::new(spec.user.name.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in username"))?;
    let home_c = CString::new(home.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in home path"))?;
    let errfile = CString::new(xsession_errors_path(home).as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in home path"))?;

    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(move || {
            // Group list first, then gid, then uid; after setuid none of
            // the earlier steps are possible any more.
            if libc::initgroups(username.as_ptr(), gid as libc::gid_t) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setgid(gid) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setuid(uid) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::chdir(home_c.as_ptr()) != 0 {
                // Home vanished between the check and now; run from /.
                let root = b"/\0";
                libc::chdir(root.as_ptr().cast());
            }
            let fd = libc::open(
                errfile.as_ptr(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                0o644,
            );
            if fd >= 0 {
                libc::dup2(fd, libc::STDERR_FILENO);
                if fd != libc::STDERR_FILENO {
                    libc::close(fd);
                }
            }
            Ok(())
        });
    }

    info!(
        login = %spec.user.name,
        session = %spec.session_name,
        failsafe = spec.failsafe,
        "starting session"
    );
    ChildHandle::spawn(cmd, ChildRole::Session)
}

/// Tail of the `.xsession-errors` capture for the crash diagnostic.
pub fn session_errors_tail(home: &Path, max_bytes: u64) -> Option<String> {
    let path = xsession_errors_path(home);
    let mut file = std::fs::File::open(&path).ok()?;
    let len = file.metadata().ok()?.len();
    if len > max_bytes {
        file.seek(io::SeekFrom::End(-(max_bytes as i64))).ok()?;
    }
    let mut buf = String::new();
    file.read_to_string(&mut buf).ok()?;
    if buf.is_empty() {
        None
    } else {
        Some(buf)
    }
}

/// Build the short-session diagnostic text.
///
/// The details offer only appears when the home directory is usable and
/// the crashed session was not already the failsafe one; diagnosing a
/// broken failsafe with another failsafe would recurse forever.
pub fn crash_message(spec_failsafe: bool, home: &Path) -> String {
    let mut msg = String::from(
        "Your session only lasted a few seconds. \
         You may have run out of disk space or the session setup is broken.",
    );
    if !spec_failsafe && home_usable(home) {
        msg.push_str(" Details may be available in ");
        msg.push_str(&xsession_errors_path(home).display().to_string());
        msg.push('.');
    }
    msg
}

/// Resolve the target user from the system database.
pub fn resolve_user(login: &str) -> Option<User> {
    match User::from_name(login) {
        Ok(Some(user)) => Some(user),
        Ok(None) => {
            warn!(login, "login has no passwd entry");
            None
        }
        Err(err) => {
            warn!(login, %err, "user lookup failed");
            None
        }
    }
}

/// Log the outcome of a finished session.
pub fn log_session_end(login: &str, status: Option<i32>, duration: Duration) {
    debug!(
        login,
        status = status.unwrap_or(-1),
        secs = duration.as_secs(),
        "session ended"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::display::DisplayType;

    fn fake_user() -> User {
        let mut user = User::from_uid(nix::unistd::getuid())
            .expect("lookup self")
            .expect("self exists");
        user.name = "alice".into();
        user.dir = PathBuf::from("/home/alice");
        user.shell = PathBuf::from("/bin/bash");
        user
    }

    fn display_with_auth() -> Display {
        let mut d = Display::new(":0", DisplayType::Local, None);
        d.userauth = Some(PathBuf::from("/home/alice/.Xauthority"));
        d
    }

    #[test]
    fn short_session_boundary() {
        assert!(ended_too_fast(Duration::from_secs(0)));
        assert!(ended_too_fast(Duration::from_secs(9)));
        assert!(ended_too_fast(Duration::from_secs(10)));
        assert!(!ended_too_fast(Duration::from_secs(11)));
        assert!(!ended_too_fast(Duration::from_secs(600)));
    }

    #[test]
    fn env_contract_is_complete() {
        let user = fake_user();
        let display = display_with_auth();
        let backend_env = vec![("XDG_SESSION_COOKIE".to_string(), "abc123".to_string())];
        let spec = SessionSpec {
            user: &user,
            command: "/etc/luxdm/Xsession",
            session_name: "default",
            backend_env: &backend_env,
            lang: Some("de_DE.UTF-8"),
            failsafe: false,
        };
        let env = build_env(&display, &spec, "/usr/bin:/bin");
        let get = |k: &str| {
            env.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("DISPLAY"), Some(":0"));
        assert_eq!(get("XAUTHORITY"), Some("/home/alice/.Xauthority"));
        assert_eq!(get("HOME"), Some("/home/alice"));
        assert_eq!(get("USER"), Some("alice"));
        assert_eq!(get("LOGNAME"), Some("alice"));
        assert_eq!(get("USERNAME"), Some("alice"));
        assert_eq!(get("SHELL"), Some("/bin/bash"));
        assert_eq!(get("GDMSESSION"), Some("default"));
        assert_eq!(get("GDM_LANG"), Some("de_DE.UTF-8"));
        assert_eq!(get("RUNNING_UNDER_GDM"), Some("true"));
        assert_eq!(get("XDG_SESSION_COOKIE"), Some("abc123"));
    }

    #[test]
    fn mail_never_reaches_the_session() {
        let user = fake_user();
        let display = display_with_auth();
        let backend_env = vec![("MAIL".to_string(), "/var/mail/alice".to_string())];
        let spec = SessionSpec {
            user: &user,
            command: "/etc/luxdm/Xsession",
            session_name: "default",
            backend_env: &backend_env,
            lang: None,
            failsafe: false,
        };
        let env = build_env(&display, &spec, "/usr/bin");
        assert!(env.iter().all(|(k, _)| k != "MAIL"));
    }

    #[test]
    fn fixed_contract_wins_backend_collisions() {
        let user = fake_user();
        let display = display_with_auth();
        let backend_env = vec![("USER".to_string(), "mallory".to_string())];
        let spec = SessionSpec {
            user: &user,
            command: "/etc/luxdm/Xsession",
            session_name: "default",
            backend_env: &backend_env,
            lang: None,
            failsafe: false,
        };
        let env = build_env(&display, &spec, "/usr/bin");
        let users: Vec<&str> = env
            .iter()
            .filter(|(k, _)| k == "USER")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(users, ["alice"]);
    }

    #[test]
    fn crash_message_offers_details_only_when_sensible() {
        let dir = tempfile::tempdir().unwrap();
        let with_details = crash_message(false, dir.path());
        assert!(with_details.contains(".xsession-errors"));

        let failsafe = crash_message(true, dir.path());
        assert!(!failsafe.contains(".xsession-errors"));

        let no_home = crash_message(false, Path::new("/nonexistent-home"));
        assert!(!no_home.contains(".xsession-errors"));
    }

    #[test]
    fn errors_tail_reads_recent_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(xsession_errors_path(dir.path()), b"line one\nline two\n").unwrap();
        let tail = session_errors_tail(dir.path(), 1024).unwrap();
        assert!(tail.contains("line two"));
        assert!(session_errors_tail(Path::new("/nonexistent-home"), 1024).is_none());
    }
}
