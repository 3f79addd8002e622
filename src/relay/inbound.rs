//! Inbound daemon notifications
//!
//! The daemon pings the slave with SIGUSR2 and writes newline-separated
//! messages into a private notify pipe. The signal handler only sets a
//! flag; at the next safe point the slave drains the (nonblocking) pipe
//! through [`NotifyQueue::drain`] and dispatches each line:
//!
//! * `A...` — acknowledgement of the slave's last FIFO message;
//! * `!key value` — a configuration key changed;
//! * `#COMMAND` — a daemon command.
//!
//! Key changes that arrive while immediate processing is disabled (the
//! slave is mid-conversation or mid-configurator) are queued and drained
//! in FIFO order once processing is re-enabled. Nothing is ever dropped.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;

use nix::sys::stat::Mode;
use tracing::{debug, warn};

use crate::common::fdio;

const MARKER_ACK: u8 = b'A';
const MARKER_KEY: u8 = b'!';
const MARKER_COMMAND: u8 = b'#';

/// Commands the daemon can push to a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCommand {
    /// Server definitions changed; remanage when convenient.
    DirtyServers,
    /// Restart now if idle, otherwise remanage after the session.
    SoftRestartServers,
    /// Startup gate released.
    Go,
}

impl DaemonCommand {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "DIRTY_SERVERS" => Some(Self::DirtyServers),
            "SOFT_RESTART_SERVERS" => Some(Self::SoftRestartServers),
            "GO" => Some(Self::Go),
            _ => None,
        }
    }
}

/// One dispatched notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    /// A configuration key changed at runtime.
    KeyChanged {
        /// Key name, e.g. `AllowRoot`.
        key: String,
        /// New value, unparsed.
        value: String,
    },
    /// A daemon command.
    Command(DaemonCommand),
}

/// Queue of inbound notifications with an enable/disable gate.
pub struct NotifyQueue {
    fd: Option<OwnedFd>,
    partial: Vec<u8>,
    enabled: bool,
    held: VecDeque<NotifyEvent>,
    ready: VecDeque<NotifyEvent>,
    got_ack: bool,
    ack_response: Option<String>,
}

impl NotifyQueue {
    /// Open (creating if needed) the slave's notify FIFO.
    ///
    /// Opened read-write so the open never blocks waiting for the daemon
    /// and the pipe never reports EOF between daemon writes.
    pub fn open(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        }
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let fd = OwnedFd::from(file);
        fdio::set_nonblocking(fd.as_raw_fd()).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        fdio::set_cloexec(fd.as_raw_fd()).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(Self::from_fd(fd))
    }

    /// Wrap an already-open nonblocking fd. Tests use pipes here.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd: Some(fd),
            partial: Vec::new(),
            enabled: true,
            held: VecDeque::new(),
            ready: VecDeque::new(),
            got_ack: false,
            ack_response: None,
        }
    }

    /// A queue with no inbound pipe at all (daemon-less operation).
    pub fn disconnected() -> Self {
        Self {
            fd: None,
            partial: Vec::new(),
            enabled: true,
            held: VecDeque::new(),
            ready: VecDeque::new(),
            got_ack: false,
            ack_response: None,
        }
    }

    /// The notify fd, when connected.
    pub fn fd(&self) -> Option<&OwnedFd> {
        self.fd.as_ref()
    }

    /// Disable immediate processing; key changes queue up until
    /// [`Self::enable`]. Nested calls are idempotent.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Re-enable immediate processing, releasing held notifications in
    /// their original order.
    pub fn enable(&mut self) {
        self.enabled = true;
        while let Some(event) = self.held.pop_front() {
            self.ready.push_back(event);
        }
    }

    /// Whether immediate processing is currently enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Pull everything currently sitting in the notify pipe and sort it
    /// into acks and events. Never blocks.
    pub fn drain(&mut self) {
        crate::common::signals::take_notify_pending();
        let Some(fd) = self.fd.as_ref() else { return };
        let bytes = match fdio::drain_nonblocking(fd.as_fd()) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "notify pipe read failed");
                return;
            }
        };
        if bytes.is_empty() {
            return;
        }
        self.partial.extend_from_slice(&bytes);
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if !line.is_empty() {
                self.dispatch_line(line);
            }
        }
    }

    fn dispatch_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(&line[1..]).into_owned();
        match line[0] {
            MARKER_ACK => {
                self.got_ack = true;
                self.ack_response = if text.is_empty() { None } else { Some(text) };
            }
            MARKER_KEY => {
                let (key, value) = match text.split_once(' ') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (text, String::new()),
                };
                let event = NotifyEvent::KeyChanged { key, value };
                if self.enabled {
                    self.ready.push_back(event);
                } else {
                    debug!(?event, "notification held until safe point");
                    self.held.push_back(event);
                }
            }
            MARKER_COMMAND => match DaemonCommand::parse(&text) {
                Some(cmd) => self.ready.push_back(NotifyEvent::Command(cmd)),
                None => warn!(command = %text, "unknown daemon command ignored"),
            },
            other => {
                warn!(marker = other, "unknown notify marker ignored");
            }
        }
    }

    /// Take the next dispatched event, FIFO.
    pub fn next_event(&mut self) -> Option<NotifyEvent> {
        self.ready.pop_front()
    }

    /// Whether an ack has arrived since [`Self::clear_ack`].
    pub fn got_ack(&self) -> bool {
        self.got_ack
    }

    /// Ack payload, when the daemon answered with data.
    pub fn take_ack_response(&mut self) -> Option<String> {
        self.ack_response.take()
    }

    /// Reset ack state before sending a message that expects one.
    pub fn clear_ack(&mut self) {
        self.got_ack = false;
        self.ack_response = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;

    fn queue_with_writer() -> (NotifyQueue, OwnedFd) {
        let (rx, tx) = nix::unistd::pipe().expect("pipe");
        fdio::set_nonblocking(rx.as_raw_fd()).unwrap();
        (NotifyQueue::from_fd(rx), tx)
    }

    fn push(tx: &OwnedFd, line: &str) {
        fdio::write_line(tx.as_fd(), line).unwrap();
    }

    #[test]
    fn ack_is_recorded_with_response() {
        let (mut q, tx) = queue_with_writer();
        push(&tx, "Asome-response");
        q.drain();
        assert!(q.got_ack());
        assert_eq!(q.take_ack_response().as_deref(), Some("some-response"));
    }

    #[test]
    fn bare_ack_has_no_response() {
        let (mut q, tx) = queue_with_writer();
        push(&tx, "A");
        q.drain();
        assert!(q.got_ack());
        assert_eq!(q.take_ack_response(), None);
    }

    #[test]
    fn key_changes_flow_through_when_enabled() {
        let (mut q, tx) = queue_with_writer();
        push(&tx, "!AllowRoot 0");
        q.drain();
        assert_eq!(
            q.next_event(),
            Some(NotifyEvent::KeyChanged { key: "AllowRoot".into(), value: "0".into() })
        );
        assert_eq!(q.next_event(), None);
    }

    #[test]
    fn held_notifications_drain_fifo_after_enable() {
        let (mut q, tx) = queue_with_writer();
        q.disable();
        push(&tx, "!RetryDelay 3");
        push(&tx, "!AllowRoot 1");
        push(&tx, "!TimedLoginDelay 30");
        q.drain();
        assert_eq!(q.next_event(), None, "nothing visible while disabled");

        q.enable();
        let keys: Vec<String> = std::iter::from_fn(|| q.next_event())
            .map(|e| match e {
                NotifyEvent::KeyChanged { key, .. } => key,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(keys, ["RetryDelay", "AllowRoot", "TimedLoginDelay"]);
    }

    #[test]
    fn commands_bypass_the_hold_gate() {
        let (mut q, tx) = queue_with_writer();
        q.disable();
        push(&tx, "#DIRTY_SERVERS");
        q.drain();
        assert_eq!(q.next_event(), Some(NotifyEvent::Command(DaemonCommand::DirtyServers)));
    }

    #[test]
    fn partial_lines_are_reassembled() {
        let (mut q, tx) = queue_with_writer();
        fdio::write_all(tx.as_fd(), b"!Gree").unwrap();
        q.drain();
        assert_eq!(q.next_event(), None);
        fdio::write_all(tx.as_fd(), b"ter /usr/bin/greeter\n").unwrap();
        q.drain();
        assert_eq!(
            q.next_event(),
            Some(NotifyEvent::KeyChanged { key: "Greeter".into(), value: "/usr/bin/greeter".into() })
        );
    }

    #[test]
    fn interleaved_ack_and_notifies_keep_order() {
        let (mut q, tx) = queue_with_writer();
        q.disable();
        push(&tx, "!TimedLogin alice");
        push(&tx, "A");
        push(&tx, "!TimedLoginEnable 1");
        q.drain();
        assert!(q.got_ack());
        q.enable();
        assert!(matches!(
            q.next_event(),
            Some(NotifyEvent::KeyChanged { ref key, .. }) if key == "TimedLogin"
        ));
        assert!(matches!(
            q.next_event(),
            Some(NotifyEvent::KeyChanged { ref key, .. }) if key == "TimedLoginEnable"
        ));
    }
}
