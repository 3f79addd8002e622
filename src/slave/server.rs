//! X server lifecycle
//!
//! Spawn the server with a fresh cookie and authority file, wait for its
//! readiness signal, and keep the consecutive-failure accounting that
//! decides when a display is beyond saving.
//!
//! Readiness uses the server's own convention: an X server started with
//! SIGUSR1 ignored signals SIGUSR1 to its parent once it accepts
//! connections.

use std::process::Command;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::common::{cookie, signals};
use crate::config::ServerConfig;
use crate::slave::child::{ChildHandle, ChildRole};
use crate::slave::display::Display;

/// Why the X server could not be brought up.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Auth-file setup or the spawn itself failed.
    #[error("X server setup failed: {0}")]
    Io(#[from] std::io::Error),
    /// The server exited before signalling readiness.
    #[error("X server exited during startup (status {0})")]
    DiedEarly(i32),
    /// No readiness signal within the configured timeout.
    #[error("X server did not become ready within {0:?}")]
    Timeout(Duration),
    /// Command template produced no executable.
    #[error("server command is empty after substitution")]
    EmptyCommand,
}

/// Substitute placeholders and split the server command line.
pub fn build_command_line(template: &str, display: &Display) -> Vec<String> {
    let authfile = display
        .authfile
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let mut args: Vec<String> = template
        .split_whitespace()
        .map(|tok| {
            tok.replace("{display}", &display.name)
                .replace("{authfile}", &authfile)
        })
        .collect();
    if let Some(vt) = display.vt {
        args.push(format!("vt{vt}"));
    }
    args
}

/// Start the X server for this display and wait until it is connectable.
///
/// On success the display holds the running server handle, its cookie and
/// the authority file path.
pub fn start(display: &mut Display, cfg: &ServerConfig, auth_dir: &std::path::Path) -> Result<(), ServerError> {
    let cookie = cookie::Cookie::generate()?;
    let authfile = cookie::write_server_auth(auth_dir, &display.name, display.number, &cookie)?;
    display.cookie = Some(cookie);
    display.authfile = Some(authfile);

    let argv = build_command_line(&cfg.command, display);
    let Some((program, args)) = argv.split_first() else {
        return Err(ServerError::EmptyCommand);
    };
    let dname = &display.name;
    info!(display = %dname, program = %program, "starting X server");

    signals::clear_server_ready();
    let mut cmd = Command::new(program);
    cmd.args(args);
    let mut handle = ChildHandle::spawn(cmd, ChildRole::Server)?;

    let timeout = Duration::from_secs(cfg.timeout);
    let deadline = Instant::now() + timeout;
    loop {
        if signals::take_server_ready() {
            let dname = &display.name;
            debug!(display = %dname, pid = handle.pid(), "X server ready");
            break;
        }
        if let Some(status) = handle.try_reap()? {
            let code = status.code().unwrap_or(-1);
            let dname = &display.name;
            warn!(display = %dname, code, "X server died before readiness");
            return Err(ServerError::DiedEarly(code));
        }
        if Instant::now() >= deadline {
            let _ = handle.terminate_and_wait(Duration::from_secs(2));
            return Err(ServerError::Timeout(timeout));
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    display.last_start = Some(Instant::now());
    display.server = Some(handle);
    Ok(())
}

/// Record an X failure and decide whether the display must be abandoned.
///
/// Failures only count as consecutive within the sliding window; an
/// isolated failure after a long quiet stretch restarts the count.
pub fn note_failure(display: &mut Display, cfg: &ServerConfig, now: Instant) -> bool {
    let window = Duration::from_secs(cfg.failure_window);
    match display.last_x_failed {
        Some(last) if now.duration_since(last) <= window => display.x_faileds += 1,
        _ => display.x_faileds = 1,
    }
    display.last_x_failed = Some(now);
    let exhausted = display.x_faileds >= cfg.max_failures;
    if exhausted {
        let dname = &display.name;
        let failures = display.x_faileds;
        warn!(
            display = %dname,
            failures,
            "X server keeps failing, abandoning display"
        );
    }
    exhausted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::display::DisplayType;

    fn display() -> Display {
        let mut d = Display::new(":1", DisplayType::Local, None);
        d.authfile = Some("/var/lib/test/auth-_1".into());
        d
    }

    #[test]
    fn command_line_substitution() {
        let mut d = display();
        d.vt = Some(7);
        let argv = build_command_line("/usr/bin/X {display} -auth {authfile}", &d);
        assert_eq!(argv, ["/usr/bin/X", ":1", "-auth", "/var/lib/test/auth-_1", "vt7"]);
    }

    #[test]
    fn command_line_without_vt() {
        let argv = build_command_line("/usr/bin/X {display} -auth {authfile}", &display());
        assert_eq!(argv.last().map(String::as_str), Some("/var/lib/test/auth-_1"));
    }

    #[test]
    fn failures_inside_window_accumulate() {
        let mut d = display();
        let cfg = ServerConfig::default();
        let t0 = Instant::now();
        assert!(!note_failure(&mut d, &cfg, t0));
        assert!(!note_failure(&mut d, &cfg, t0 + Duration::from_secs(10)));
        assert!(note_failure(&mut d, &cfg, t0 + Duration::from_secs(20)));
        assert_eq!(d.x_faileds, 3);
    }

    #[test]
    fn failures_outside_window_restart_the_count() {
        let mut d = display();
        let cfg = ServerConfig::default();
        let t0 = Instant::now();
        note_failure(&mut d, &cfg, t0);
        note_failure(&mut d, &cfg, t0 + Duration::from_secs(10));
        // Quiet stretch longer than the window.
        assert!(!note_failure(&mut d, &cfg, t0 + Duration::from_secs(200)));
        assert_eq!(d.x_faileds, 1);
    }
}
