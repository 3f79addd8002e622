//! Wire protocol between slave and greeter
//!
//! Requests are `STX opcode [argument] \n`. Replies are free-form bytes in
//! which everything before the first STX is noise (partial writes, stray
//! warnings from the greeter's toolkit) and the reply text runs from STX to
//! the following newline.
//!
//! A reply whose text begins with BEL is not an answer at all but an
//! out-of-band interrupt; the byte after BEL selects the interrupt kind and
//! any remaining bytes are its payload. Callers must always check for
//! interruption before trusting reply content.

use thiserror::Error;

/// Start-of-text framing byte.
pub const STX: u8 = 0x02;

/// Interrupt marker byte.
pub const BEL: u8 = 0x07;

/// Request opcodes understood by the greeter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Prompt for visible text input.
    Prompt,
    /// Prompt for hidden text input.
    NoEcho,
    /// Display an informational message.
    Msg,
    /// Show text in the inline error box.
    ErrBox,
    /// Raise a modal error dialog.
    ErrDlg,
    /// Reset the UI after a failed attempt.
    Reset,
    /// Reset without the failure animation.
    ResetOk,
    /// Tell the greeter which login name is being processed.
    SetLogin,
    /// Ask the greeter to exit.
    Quit,
    /// Start the timed-login countdown.
    StartTimer,
    /// Stop the timed-login countdown.
    StopTimer,
    /// Disable the login screen.
    Disable,
    /// Re-enable the login screen.
    Enable,
    /// Allow the login window to take focus.
    Focus,
    /// Keep focus away from the login window.
    NoFocus,
    /// Query the selected session.
    QuerySession,
    /// Query whether the session choice should be saved.
    SaveSession,
    /// Query the selected language.
    QueryLanguage,
    /// Query whether the language choice should be saved.
    SaveLanguage,
    /// Ask whether caps lock is active.
    QueryCapsLock,
    /// Ask whether the greeter wants a user picture.
    NeedPic,
    /// Hand over a user picture in a temporary file.
    ReadPic,
}

impl Opcode {
    /// Single-byte wire encoding.
    pub fn byte(self) -> u8 {
        match self {
            Opcode::Prompt => b'N',
            Opcode::NoEcho => b'U',
            Opcode::Msg => b'D',
            Opcode::ErrBox => b'e',
            Opcode::ErrDlg => b'E',
            Opcode::Reset => b'A',
            Opcode::ResetOk => b'r',
            Opcode::SetLogin => b'l',
            Opcode::Quit => b'P',
            Opcode::StartTimer => b's',
            Opcode::StopTimer => b'S',
            Opcode::Disable => b'-',
            Opcode::Enable => b'+',
            Opcode::Focus => b'F',
            Opcode::NoFocus => b'f',
            Opcode::QuerySession => b'G',
            Opcode::SaveSession => b'C',
            Opcode::QueryLanguage => b'&',
            Opcode::SaveLanguage => b'R',
            Opcode::QueryCapsLock => b'Q',
            Opcode::NeedPic => b'#',
            Opcode::ReadPic => b'%',
        }
    }
}

/// Out-of-band interruption kinds the greeter can raise mid-conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Timed-login countdown expired.
    TimedLogin,
    /// The user asked for the configurator.
    Configure,
    /// The user asked the machine to suspend; proxied to the daemon, the
    /// conversation itself continues.
    Suspend,
    /// The user cancelled the current attempt.
    Cancel,
    /// A user was picked from the face browser; payload is the login name.
    SelectUser,
    /// A language was picked; payload is the locale.
    SelectLanguage,
}

impl Interrupt {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'T' => Some(Interrupt::TimedLogin),
            b'C' => Some(Interrupt::Configure),
            b'S' => Some(Interrupt::Suspend),
            b'X' => Some(Interrupt::Cancel),
            b'U' => Some(Interrupt::SelectUser),
            b'O' => Some(Interrupt::SelectLanguage),
            _ => None,
        }
    }
}

/// A decoded greeter reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A plain answer; empty string for bare acknowledgements.
    Answer(String),
    /// An interruption with its payload bytes (already past the kind byte).
    Interrupted(Interrupt, String),
}

/// Decode failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// BEL with a subtype this slave does not understand.
    #[error("unknown interrupt subtype {0:#04x}")]
    UnknownInterrupt(u8),
    /// BEL with nothing after it.
    #[error("truncated interrupt reply")]
    TruncatedInterrupt,
    /// Reply text was not valid UTF-8.
    #[error("reply is not valid UTF-8")]
    BadEncoding,
}

/// Encode a request line.
pub fn encode_request(op: Opcode, arg: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(arg.len() + 3);
    out.push(STX);
    out.push(op.byte());
    out.extend_from_slice(arg.as_bytes());
    out.push(b'\n');
    out
}

/// Decode the reply text found between STX and the newline.
///
/// Interruption takes precedence over content: a BEL reply decodes as
/// [`Reply::Interrupted`] no matter what trails it.
pub fn decode_reply(line: &[u8]) -> Result<Reply, ProtocolError> {
    if line.first() == Some(&BEL) {
        let kind_byte = *line.get(1).ok_or(ProtocolError::TruncatedInterrupt)?;
        let kind = Interrupt::from_byte(kind_byte)
            .ok_or(ProtocolError::UnknownInterrupt(kind_byte))?;
        let payload = std::str::from_utf8(&line[2..])
            .map_err(|_| ProtocolError::BadEncoding)?
            .to_string();
        return Ok(Reply::Interrupted(kind, payload));
    }
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::BadEncoding)?;
    Ok(Reply::Answer(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encoding() {
        assert_eq!(encode_request(Opcode::Prompt, "Username:"), b"\x02NUsername:\n");
        assert_eq!(encode_request(Opcode::Quit, ""), b"\x02P\n");
    }

    #[test]
    fn plain_answer() {
        assert_eq!(decode_reply(b"alice").unwrap(), Reply::Answer("alice".into()));
        assert_eq!(decode_reply(b"").unwrap(), Reply::Answer(String::new()));
    }

    #[test]
    fn interrupt_takes_precedence_over_trailing_bytes() {
        let reply = decode_reply(b"\x07Ttrailing junk").unwrap();
        assert_eq!(reply, Reply::Interrupted(Interrupt::TimedLogin, "trailing junk".into()));
    }

    #[test]
    fn select_user_carries_payload() {
        let reply = decode_reply(b"\x07Ubob").unwrap();
        assert_eq!(reply, Reply::Interrupted(Interrupt::SelectUser, "bob".into()));
    }

    #[test]
    fn unknown_interrupt_is_an_error() {
        assert_eq!(decode_reply(b"\x07z"), Err(ProtocolError::UnknownInterrupt(b'z')));
        assert_eq!(decode_reply(b"\x07"), Err(ProtocolError::TruncatedInterrupt));
    }

    #[test]
    fn opcode_bytes_are_distinct() {
        let all = [
            Opcode::Prompt,
            Opcode::NoEcho,
            Opcode::Msg,
            Opcode::ErrBox,
            Opcode::ErrDlg,
            Opcode::Reset,
            Opcode::ResetOk,
            Opcode::SetLogin,
            Opcode::Quit,
            Opcode::StartTimer,
            Opcode::StopTimer,
            Opcode::Disable,
            Opcode::Enable,
            Opcode::Focus,
            Opcode::NoFocus,
            Opcode::QuerySession,
            Opcode::SaveSession,
            Opcode::QueryLanguage,
            Opcode::SaveLanguage,
            Opcode::QueryCapsLock,
            Opcode::NeedPic,
            Opcode::ReadPic,
        ];
        let mut seen = std::collections::HashSet::new();
        for op in all {
            assert!(seen.insert(op.byte()), "duplicate opcode byte for {op:?}");
        }
    }
}
