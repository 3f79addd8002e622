//! Line-oriented fd I/O
//!
//! Small EINTR-aware wrappers over raw descriptor reads and writes. The
//! greeter and daemon channels are newline-framed byte streams on plain
//! pipes and FIFOs, so everything here works in terms of single lines.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

/// Longest line any of the slave's channels will accept.
pub const MAX_LINE: usize = 8192;

fn retry_eintr<F: FnMut() -> isize>(mut op: F) -> io::Result<usize> {
    loop {
        let n = op();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        if crate::common::signals::term_pending() {
            // A termination request interrupted us; let the caller unwind
            // to its safe point instead of resuming the blocking call.
            return Err(err);
        }
    }
}

/// Read a single byte. `Ok(None)` on end of file.
pub fn read_byte(fd: BorrowedFd<'_>) -> io::Result<Option<u8>> {
    let mut buf = [0u8; 1];
    let n = retry_eintr(|| unsafe {
        libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), 1) as isize
    })?;
    Ok(if n == 0 { None } else { Some(buf[0]) })
}

/// Write the whole buffer, retrying partial writes.
pub fn write_all(fd: BorrowedFd<'_>, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = retry_eintr(|| unsafe {
            libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) as isize
        })?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "fd write returned zero"));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Format and write a newline-terminated line.
pub fn write_line(fd: BorrowedFd<'_>, line: &str) -> io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    write_all(fd, &buf)
}

/// Read bytes until a newline, which is consumed but not returned.
///
/// `Ok(None)` when end of file is hit before any byte of the line. Lines
/// longer than [`MAX_LINE`] are truncated rather than growing without
/// bound; the remainder up to the newline is discarded.
pub fn read_line(fd: BorrowedFd<'_>) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let mut got_any = false;
    loop {
        match read_byte(fd)? {
            None => {
                return Ok(if got_any { Some(line) } else { None });
            }
            Some(b'\n') => return Ok(Some(line)),
            Some(byte) => {
                got_any = true;
                if line.len() < MAX_LINE {
                    line.push(byte);
                }
            }
        }
    }
}

/// Drain whatever is currently readable from a nonblocking fd.
///
/// Returns the bytes read, which may be empty when nothing is pending.
/// Safe to call from the main flow at any time; never blocks.
pub fn drain_nonblocking(fd: BorrowedFd<'_>) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            out.extend_from_slice(&buf[..n as usize]);
            continue;
        }
        if n == 0 {
            return Ok(out);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(out),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err),
        }
    }
}

/// Wait up to `timeout_ms` for the fd to become readable.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd { fd: fd.as_raw_fd(), events: libc::POLLIN, revents: 0 };
    loop {
        let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if n > 0 {
            return Ok(true);
        }
        if n == 0 {
            return Ok(false);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        if crate::common::signals::term_pending() {
            return Ok(false);
        }
    }
}

/// Switch an fd to nonblocking mode.
pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(nix::errno::Errno::last());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}

/// Mark an fd close-on-exec so children never inherit it.
pub fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    fn pipe_pair() -> (std::os::fd::OwnedFd, std::os::fd::OwnedFd) {
        nix::unistd::pipe().expect("pipe")
    }

    #[test]
    fn line_roundtrip() {
        let (rx, tx) = pipe_pair();
        write_line(tx.as_fd(), "hello world").unwrap();
        let line = read_line(rx.as_fd()).unwrap().unwrap();
        assert_eq!(line, b"hello world");
    }

    #[test]
    fn read_line_reports_eof() {
        let (rx, tx) = pipe_pair();
        drop(tx);
        assert!(read_line(rx.as_fd()).unwrap().is_none());
    }

    #[test]
    fn read_line_returns_partial_line_at_eof() {
        let (rx, tx) = pipe_pair();
        write_all(tx.as_fd(), b"no newline").unwrap();
        drop(tx);
        let line = read_line(rx.as_fd()).unwrap().unwrap();
        assert_eq!(line, b"no newline");
    }

    #[test]
    fn drain_nonblocking_empty_pipe() {
        let (rx, _tx) = pipe_pair();
        set_nonblocking(rx.as_raw_fd()).unwrap();
        assert!(drain_nonblocking(rx.as_fd()).unwrap().is_empty());
    }

    #[test]
    fn drain_nonblocking_picks_up_pending_bytes() {
        let (rx, tx) = pipe_pair();
        set_nonblocking(rx.as_raw_fd()).unwrap();
        write_all(tx.as_fd(), b"abc\ndef\n").unwrap();
        assert_eq!(drain_nonblocking(rx.as_fd()).unwrap(), b"abc\ndef\n");
    }

    #[test]
    fn wait_readable_times_out() {
        let (rx, _tx) = pipe_pair();
        assert!(!wait_readable(rx.as_fd(), 10).unwrap());
    }
}
