//! Conversation seam between backends and the greeter
//!
//! Backends never touch the greeter wire protocol. They talk to a
//! [`Converse`] implementation: the real one forwards prompts over the
//! greeter channel; the null one refuses prompts and is used for
//! autologin flows where no greeter exists yet.

use tracing::{info, warn};

use crate::greeter::{GreeterChannel, Opcode};

/// Why a conversation request could not be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverseError {
    /// The exchange was interrupted (greeter event or greeter death);
    /// the caller must unwind to its safe point.
    Interrupted,
    /// This conversation cannot prompt at all.
    Unavailable,
}

/// Prompt/notify surface offered to authentication backends.
pub trait Converse {
    /// Ask for visible input (username and similar).
    fn prompt_echo_on(&mut self, prompt: &str) -> Result<String, ConverseError>;

    /// Ask for hidden input (passwords).
    fn prompt_echo_off(&mut self, prompt: &str) -> Result<String, ConverseError>;

    /// Show an informational message.
    fn info(&mut self, msg: &str);

    /// Show an error message.
    fn error_box(&mut self, msg: &str);

    /// Tell the UI which login is being processed.
    fn set_login(&mut self, _login: &str) {}

    /// Start the timed-login countdown, where supported.
    fn start_timer(&mut self) {}

    /// Stop the timed-login countdown.
    fn stop_timer(&mut self) {}
}

/// [`Converse`] over the greeter channel.
pub struct GreeterConverse<'a> {
    chan: &'a mut GreeterChannel,
    timer_allowed: bool,
}

impl<'a> GreeterConverse<'a> {
    /// Wrap a greeter channel. `timer_allowed` gates the timed-login
    /// countdown (only the first attached display may run it).
    pub fn new(chan: &'a mut GreeterChannel, timer_allowed: bool) -> Self {
        Self { chan, timer_allowed }
    }

    fn prompt(&mut self, op: Opcode, prompt: &str) -> Result<String, ConverseError> {
        let answer = self.chan.ctl(op, prompt);
        if self.chan.interrupted() {
            return Err(ConverseError::Interrupted);
        }
        Ok(answer.unwrap_or_default())
    }
}

impl Converse for GreeterConverse<'_> {
    fn prompt_echo_on(&mut self, prompt: &str) -> Result<String, ConverseError> {
        self.prompt(Opcode::Prompt, prompt)
    }

    fn prompt_echo_off(&mut self, prompt: &str) -> Result<String, ConverseError> {
        self.prompt(Opcode::NoEcho, prompt)
    }

    fn info(&mut self, msg: &str) {
        self.chan.ctl_noret(Opcode::Msg, msg);
    }

    fn error_box(&mut self, msg: &str) {
        self.chan.ctl_noret(Opcode::ErrBox, msg);
    }

    fn set_login(&mut self, login: &str) {
        self.chan.ctl_noret(Opcode::SetLogin, login);
    }

    fn start_timer(&mut self) {
        if self.timer_allowed {
            self.chan.ctl_noret(Opcode::StartTimer, "");
        }
    }

    fn stop_timer(&mut self) {
        if self.timer_allowed {
            self.chan.ctl_noret(Opcode::StopTimer, "");
        }
    }
}

/// Conversation for flows without a greeter. Prompts fail, messages go to
/// the log so autologin problems still leave a trace for the admin.
#[derive(Debug, Default)]
pub struct NullConverse;

impl Converse for NullConverse {
    fn prompt_echo_on(&mut self, prompt: &str) -> Result<String, ConverseError> {
        warn!(prompt, "prompt requested in promptless context");
        Err(ConverseError::Unavailable)
    }

    fn prompt_echo_off(&mut self, prompt: &str) -> Result<String, ConverseError> {
        warn!(prompt, "hidden prompt requested in promptless context");
        Err(ConverseError::Unavailable)
    }

    fn info(&mut self, msg: &str) {
        info!(msg, "auth info");
    }

    fn error_box(&mut self, msg: &str) {
        warn!(msg, "auth error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::fdio;
    use crate::greeter::protocol::{BEL, STX};
    use std::os::fd::AsFd;

    fn channel(script: &[u8]) -> (GreeterChannel, std::os::fd::OwnedFd) {
        let (rx, tx) = nix::unistd::pipe().expect("pipe");
        let (req_rx, req_tx) = nix::unistd::pipe().expect("pipe");
        fdio::write_all(tx.as_fd(), script).unwrap();
        drop(tx);
        (GreeterChannel::from_fds(rx, req_tx), req_rx)
    }

    #[test]
    fn prompts_route_through_the_channel() {
        let (mut chan, _req_rx) = channel(b"\x02alice\n");
        let mut conv = GreeterConverse::new(&mut chan, false);
        assert_eq!(conv.prompt_echo_on("Username:"), Ok("alice".into()));
    }

    #[test]
    fn interruption_maps_to_converse_error() {
        let script = [STX, BEL, b'X', b'\n'];
        let (mut chan, _req_rx) = channel(&script);
        let mut conv = GreeterConverse::new(&mut chan, false);
        assert_eq!(conv.prompt_echo_off("Password:"), Err(ConverseError::Interrupted));
    }

    #[test]
    fn null_converse_refuses_prompts() {
        let mut conv = NullConverse;
        assert_eq!(conv.prompt_echo_on("Username:"), Err(ConverseError::Unavailable));
        assert_eq!(conv.prompt_echo_off("Password:"), Err(ConverseError::Unavailable));
    }
}
