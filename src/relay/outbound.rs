//! Outbound messages to the daemon
//!
//! All slaves share one well-known FIFO on the daemon side. Messages are
//! single text lines, opcode first, then the slave pid where the protocol
//! calls for it, then arguments.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::common::fdio;

/// Messages the slave can send to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMsg {
    /// X server pid for this display (0 when it went away).
    XPid(u32),
    /// Session child pid.
    SessPid(u32),
    /// Greeter pid.
    GreetPid(u32),
    /// Chooser pid.
    ChooserPid(u32),
    /// Login state toggled.
    LoggedIn(bool),
    /// Current login name; empty string clears it.
    Login(String),
    /// Display cookie in hex.
    Cookie(String),
    /// Display number.
    DispNum(u16),
    /// Kernel virtual terminal in use.
    VtNum(i32),
    /// Flexi-server startup failed with the given error code.
    FlexiErr(i32),
    /// Flexi-server startup succeeded.
    FlexiOk,
    /// Ask the daemon for a soft restart.
    SoftRestart,
    /// Ask the daemon to start the next waiting local display.
    StartNextLocal,
    /// Chooser picked a host for this attached display.
    ChosenLocal(String),
    /// Forwarded suspend request from the greeter.
    SuspendMachine,
}

impl DaemonMsg {
    /// Render the wire line for a slave with the given pid.
    pub fn render(&self, pid: u32) -> String {
        match self {
            DaemonMsg::XPid(p) => format!("XPID {pid} {p}"),
            DaemonMsg::SessPid(p) => format!("SESSPID {pid} {p}"),
            DaemonMsg::GreetPid(p) => format!("GREETPID {pid} {p}"),
            DaemonMsg::ChooserPid(p) => format!("CHOOSERPID {pid} {p}"),
            DaemonMsg::LoggedIn(on) => format!("LOGGED_IN {pid} {}", i32::from(*on)),
            DaemonMsg::Login(name) => format!("LOGIN {pid} {name}"),
            DaemonMsg::Cookie(hex) => format!("COOKIE {pid} {hex}"),
            DaemonMsg::DispNum(n) => format!("DISP_NUM {pid} {n}"),
            DaemonMsg::VtNum(n) => format!("VT_NUM {pid} {n}"),
            DaemonMsg::FlexiErr(code) => format!("FLEXI_ERR {pid} {code}"),
            DaemonMsg::FlexiOk => format!("FLEXI_OK {pid}"),
            DaemonMsg::SoftRestart => "SOFT_RESTART".to_string(),
            DaemonMsg::StartNextLocal => "START_NEXT_LOCAL".to_string(),
            DaemonMsg::ChosenLocal(host) => format!("CHOSEN_LOCAL {pid} {host}"),
            DaemonMsg::SuspendMachine => format!("SUSPEND_MACHINE {pid}"),
        }
    }
}

/// Writer side of the daemon FIFO.
pub struct DaemonLink {
    path: PathBuf,
    fd: Option<OwnedFd>,
    pid: u32,
}

impl DaemonLink {
    /// Open the daemon FIFO for writing.
    ///
    /// A missing or reader-less FIFO leaves the link in disconnected mode:
    /// sends are logged and discarded so a standalone slave keeps working.
    pub fn open(path: &Path) -> Self {
        let fd = Self::try_open(path);
        if fd.is_none() {
            warn!(path = %path.display(), "daemon fifo unavailable, running detached");
        }
        Self { path: path.to_path_buf(), fd, pid: std::process::id() }
    }

    fn try_open(path: &Path) -> Option<OwnedFd> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .append(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOFOLLOW)
            .open(path)
            .ok()?;
        let fd = OwnedFd::from(file);
        let _ = fdio::set_cloexec(fd.as_raw_fd());
        Some(fd)
    }

    /// A link that drops everything. Tests and daemon-less operation.
    pub fn disconnected() -> Self {
        Self { path: PathBuf::new(), fd: None, pid: std::process::id() }
    }

    /// Override the pid stamped into messages. Test hook.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Write one message line.
    pub fn send(&mut self, msg: &DaemonMsg) -> io::Result<()> {
        if self.fd.is_none() && !self.path.as_os_str().is_empty() {
            self.fd = Self::try_open(&self.path);
        }
        let Some(fd) = self.fd.as_ref() else {
            debug!(?msg, "dropping daemon message, link detached");
            return Ok(());
        };
        let line = msg.render(self.pid);
        // Framed with a leading newline so a half-written line from a
        // crashed writer cannot glue itself onto this message. Short
        // single-write lines are assumed atomic on the shared FIFO; all
        // slaves rely on the kernel's PIPE_BUF guarantee here.
        let framed = format!("\n{line}\n");
        match fdio::write_all(fd.as_fd(), framed.as_bytes()) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%err, ?msg, "daemon fifo write failed, dropping link");
                self.fd = None;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendering_matches_the_wire_contract() {
        assert_eq!(DaemonMsg::XPid(4242).render(77), "XPID 77 4242");
        assert_eq!(DaemonMsg::LoggedIn(true).render(77), "LOGGED_IN 77 1");
        assert_eq!(DaemonMsg::LoggedIn(false).render(77), "LOGGED_IN 77 0");
        assert_eq!(DaemonMsg::Login("alice".into()).render(77), "LOGIN 77 alice");
        assert_eq!(DaemonMsg::Login(String::new()).render(77), "LOGIN 77 ");
        assert_eq!(DaemonMsg::DispNum(2).render(77), "DISP_NUM 77 2");
        assert_eq!(DaemonMsg::SoftRestart.render(77), "SOFT_RESTART");
        assert_eq!(DaemonMsg::StartNextLocal.render(77), "START_NEXT_LOCAL");
        assert_eq!(DaemonMsg::FlexiOk.render(77), "FLEXI_OK 77");
        assert_eq!(DaemonMsg::ChosenLocal("10.0.0.5".into()).render(77), "CHOSEN_LOCAL 77 10.0.0.5");
    }

    #[test]
    fn messages_are_newline_framed_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        std::fs::write(&path, b"").unwrap();
        let mut link = DaemonLink::open(&path).with_pid(9);
        link.send(&DaemonMsg::Cookie("deadbeef".into())).unwrap();
        link.send(&DaemonMsg::LoggedIn(true)).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "\nCOOKIE 9 deadbeef\n\nLOGGED_IN 9 1\n");
    }

    #[test]
    fn disconnected_link_swallows_messages() {
        let mut link = DaemonLink::disconnected();
        assert!(link.send(&DaemonMsg::FlexiOk).is_ok());
    }

    #[test]
    fn missing_fifo_degrades_to_detached() {
        let mut link = DaemonLink::open(Path::new("/nonexistent/luxdm-fifo"));
        assert!(link.send(&DaemonMsg::SoftRestart).is_ok());
    }
}
