//! Synchronous channel to the greeter process
//!
//! Owns the pipe pair and the sticky interrupt flags. Every control call
//! goes through [`GreeterChannel::ctl`]: write one request line, then block
//! reading until a framed reply arrives. Interruptions and greeter death
//! both surface as "no answer" plus flag state, so a caller deep inside a
//! PAM conversation never has to understand protocol details; it just
//! unwinds and lets the orchestrator inspect the flags.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::process::{Child, Command, Stdio};

use tracing::{debug, warn};

use crate::common::fdio;
use crate::greeter::protocol::{self, Interrupt, Opcode, Reply, STX};

/// Sticky interruption state accumulated while talking to the greeter.
///
/// Set during [`GreeterChannel::ctl`] reads and consulted by the
/// orchestrator immediately after the blocking call returns.
#[derive(Debug, Default, Clone)]
pub struct InterruptFlags {
    /// Timed-login countdown fired.
    pub do_timed_login: bool,
    /// Configurator requested.
    pub do_configurator: bool,
    /// Current attempt cancelled.
    pub do_cancel: bool,
    /// Machine suspend requested; proxied by the orchestrator.
    pub suspend_requested: bool,
    /// User picked from the face browser.
    pub selected_user: Option<String>,
    /// Language selection; restarts the greeter to apply.
    pub selected_language: Option<String>,
}

impl InterruptFlags {
    fn any_diversion(&self) -> bool {
        self.do_timed_login || self.do_configurator || self.do_cancel
    }
}

/// The slave end of the greeter pipe pair.
pub struct GreeterChannel {
    reply_rx: OwnedFd,
    request_tx: OwnedFd,
    alive: bool,
    interrupted: bool,
    flags: InterruptFlags,
}

impl GreeterChannel {
    /// Spawn the greeter from a prepared command, wiring its stdin/stdout
    /// to the protocol pipes. The caller keeps the [`Child`] for pid
    /// bookkeeping and exit-code mapping.
    pub fn spawn(mut cmd: Command) -> io::Result<(Child, Self)> {
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("greeter stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("greeter stdout not captured"))?;
        debug!(pid = child.id(), "greeter spawned");
        Ok((child, Self::from_fds(OwnedFd::from(stdout), OwnedFd::from(stdin))))
    }

    /// Build a channel directly from fds. Used by tests with plain pipes.
    pub fn from_fds(reply_rx: OwnedFd, request_tx: OwnedFd) -> Self {
        Self {
            reply_rx,
            request_tx,
            alive: true,
            interrupted: false,
            flags: InterruptFlags::default(),
        }
    }

    /// Whether the greeter is still believed to be on the other end.
    pub fn alive(&self) -> bool {
        self.alive
    }

    /// Whether the last control call ended in an interruption (including
    /// greeter death). Cleared by [`Self::take_interrupted`].
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Consume the interruption marker.
    pub fn take_interrupted(&mut self) -> bool {
        std::mem::replace(&mut self.interrupted, false)
    }

    /// Read-only view of the sticky flags.
    pub fn flags(&self) -> &InterruptFlags {
        &self.flags
    }

    /// Take and reset the sticky flags.
    pub fn take_flags(&mut self) -> InterruptFlags {
        std::mem::take(&mut self.flags)
    }

    /// Send a request and wait for the reply text.
    ///
    /// Returns `None` when there is no usable answer: empty reply, any
    /// interruption, or a dead greeter. Callers that care which of those
    /// happened look at [`Self::interrupted`] and [`Self::flags`]; they
    /// must never treat `None` as a valid empty answer.
    pub fn ctl(&mut self, op: Opcode, arg: &str) -> Option<String> {
        if !self.alive {
            return None;
        }
        let request = protocol::encode_request(op, arg);
        if let Err(err) = fdio::write_all(self.request_tx.as_fd(), &request) {
            warn!(%err, "greeter request write failed, marking greeter gone");
            self.mark_gone();
            return None;
        }

        loop {
            let line = match self.read_framed_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    // EOF before a frame: the greeter died or wedged.
                    self.mark_gone();
                    return None;
                }
                Err(err) => {
                    warn!(%err, "greeter reply read failed, marking greeter gone");
                    self.mark_gone();
                    return None;
                }
            };

            match protocol::decode_reply(&line) {
                Ok(Reply::Answer(text)) => {
                    return if text.is_empty() { None } else { Some(text) };
                }
                Ok(Reply::Interrupted(kind, payload)) => {
                    if self.note_interrupt(kind, payload) {
                        return None;
                    }
                    // Proxied interrupts (suspend) leave the conversation
                    // running; keep waiting for the real answer.
                }
                Err(err) => {
                    warn!(%err, "undecodable greeter reply treated as interruption");
                    self.interrupted = true;
                    return None;
                }
            }
        }
    }

    /// Send a request whose reply is only an acknowledgement.
    pub fn ctl_noret(&mut self, op: Opcode, arg: &str) {
        let _ = self.ctl(op, arg);
    }

    /// Ask the greeter to quit and stop using the channel.
    pub fn quit(&mut self) {
        if self.alive {
            self.ctl_noret(Opcode::Quit, "");
            self.alive = false;
        }
    }

    fn mark_gone(&mut self) {
        self.alive = false;
        self.interrupted = true;
    }

    /// Record an interrupt; returns true when the current conversation
    /// should be abandoned.
    fn note_interrupt(&mut self, kind: Interrupt, payload: String) -> bool {
        debug!(?kind, "greeter interrupt");
        match kind {
            Interrupt::TimedLogin => {
                self.flags.do_timed_login = true;
            }
            Interrupt::Configure => {
                self.flags.do_configurator = true;
            }
            Interrupt::Cancel => {
                self.flags.do_cancel = true;
            }
            Interrupt::Suspend => {
                self.flags.suspend_requested = true;
                return false;
            }
            Interrupt::SelectUser => {
                self.flags.selected_user = Some(payload);
            }
            Interrupt::SelectLanguage => {
                self.flags.selected_language = Some(payload);
            }
        }
        self.interrupted = true;
        true
    }

    /// Skip noise until STX, then collect the reply line.
    fn read_framed_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match fdio::read_byte(self.reply_rx.as_fd())? {
                None => return Ok(None),
                Some(STX) => break,
                Some(_) => continue,
            }
        }
        let mut line = Vec::new();
        loop {
            match fdio::read_byte(self.reply_rx.as_fd())? {
                None => return Ok(None),
                Some(b'\n') => return Ok(Some(line)),
                Some(byte) => {
                    if line.len() < fdio::MAX_LINE {
                        line.push(byte);
                    }
                }
            }
        }
    }

    /// Whether an unconsumed diversion (timed login, configurator, cancel)
    /// is pending.
    pub fn diversion_pending(&self) -> bool {
        self.flags.any_diversion()
    }
}
