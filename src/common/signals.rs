//! Signal blocking and delivery flags
//!
//! Two cooperating facilities:
//!
//! 1. Reference-counted signal-block sections (`block_push`/`block_pop` and
//!    the RAII [`SignalBlock`]). The first push of a class blocks its signal
//!    set and saves the previous mask; the matching final pop restores it.
//!    Nested pushes from inner call frames are supported. Popping with a
//!    zero counter is a programming error and panics.
//!
//! 2. Handler-side delivery flags. The installed handlers do nothing but
//!    set an atomic flag and write one byte to a wake pipe; the main control
//!    flow consumes the flags at safe points. No blocking work ever happens
//!    in signal context.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

use crate::common::fdio;

/// Signal classes that can be blocked as a unit.
///
/// Mirrors the three critical-section flavors the slave needs: child
/// reaping, termination requests and daemon notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockClass {
    /// SIGCHLD.
    Child,
    /// SIGTERM, SIGINT and SIGHUP.
    Terminate,
    /// SIGUSR2 (daemon notification ping).
    Notify,
}

struct BlockState {
    depth: u32,
    saved: Option<SigSet>,
}

impl BlockState {
    const fn new() -> Self {
        Self { depth: 0, saved: None }
    }
}

thread_local! {
    static BLOCKS: RefCell<[BlockState; 3]> =
        const { RefCell::new([BlockState::new(), BlockState::new(), BlockState::new()]) };
}

fn class_set(class: BlockClass) -> SigSet {
    let mut set = SigSet::empty();
    match class {
        BlockClass::Child => {
            set.add(Signal::SIGCHLD);
        }
        BlockClass::Terminate => {
            set.add(Signal::SIGTERM);
            set.add(Signal::SIGINT);
            set.add(Signal::SIGHUP);
        }
        BlockClass::Notify => {
            set.add(Signal::SIGUSR2);
        }
    }
    set
}

/// Enter a blocked section for `class`.
///
/// On the 0 to 1 transition the class signal set is added to the mask and
/// the previous mask is saved. Deeper pushes only bump the counter.
pub fn block_push(class: BlockClass) {
    BLOCKS.with(|blocks| {
        let mut blocks = blocks.borrow_mut();
        let state = &mut blocks[class as usize];
        state.depth += 1;
        if state.depth == 1 {
            let mut old = SigSet::empty();
            sigprocmask(SigmaskHow::SIG_BLOCK, Some(&class_set(class)), Some(&mut old))
                .expect("sigprocmask(SIG_BLOCK) cannot fail with a valid set");
            state.saved = Some(old);
        }
    });
}

/// Leave a blocked section for `class`.
///
/// Only the pop matching the outermost push restores the saved mask.
///
/// # Panics
///
/// Panics if called without a matching [`block_push`]; a negative counter
/// would silently corrupt the mask, so misuse fails loudly instead.
pub fn block_pop(class: BlockClass) {
    BLOCKS.with(|blocks| {
        let mut blocks = blocks.borrow_mut();
        let state = &mut blocks[class as usize];
        assert!(state.depth > 0, "signal block pop without matching push for {class:?}");
        state.depth -= 1;
        if state.depth == 0 {
            let saved = state
                .saved
                .take()
                .expect("outermost signal block pop must have a saved mask");
            sigprocmask(SigmaskHow::SIG_SETMASK, Some(&saved), None)
                .expect("sigprocmask(SIG_SETMASK) cannot fail with a valid set");
        }
    });
}

/// Current nesting depth for `class`. Exposed for diagnostics and tests.
pub fn block_depth(class: BlockClass) -> u32 {
    BLOCKS.with(|blocks| blocks.borrow()[class as usize].depth)
}

/// RAII wrapper pairing [`block_push`] with [`block_pop`].
///
/// Used to bracket any sequence that must be atomic with respect to a
/// signal class, most importantly child spawns that publish a pid the
/// SIGCHLD path will later inspect.
#[must_use = "dropping immediately ends the blocked section"]
pub struct SignalBlock {
    class: BlockClass,
}

impl SignalBlock {
    /// Block `class` until the guard is dropped.
    pub fn new(class: BlockClass) -> Self {
        block_push(class);
        Self { class }
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        block_pop(self.class);
    }
}

static CHILD_PENDING: AtomicBool = AtomicBool::new(false);
static TERM_PENDING: AtomicBool = AtomicBool::new(false);
static NOTIFY_PENDING: AtomicBool = AtomicBool::new(false);
static SERVER_READY: AtomicBool = AtomicBool::new(false);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

fn wake() {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        // Best effort; a full pipe already guarantees a pending wakeup.
        unsafe {
            libc::write(fd, b"w".as_ptr().cast(), 1);
        }
    }
}

extern "C" fn on_child(_: libc::c_int) {
    CHILD_PENDING.store(true, Ordering::Relaxed);
    wake();
}

extern "C" fn on_term(_: libc::c_int) {
    TERM_PENDING.store(true, Ordering::Relaxed);
    wake();
}

extern "C" fn on_notify(_: libc::c_int) {
    NOTIFY_PENDING.store(true, Ordering::Relaxed);
    wake();
}

extern "C" fn on_server_ready(_: libc::c_int) {
    SERVER_READY.store(true, Ordering::Relaxed);
    wake();
}

/// Install the slave's signal handlers and return the wake-pipe read end.
///
/// The returned fd becomes readable whenever any handler fires; pollers can
/// use it to turn signal delivery into fd readiness. SIGTERM/SIGINT/SIGHUP
/// are installed without `SA_RESTART` so blocking reads are interrupted and
/// the termination flag gets observed promptly.
pub fn install() -> nix::Result<OwnedFd> {
    let (read_end, write_end) = nix::unistd::pipe()?;
    fdio::set_nonblocking(read_end.as_raw_fd())?;
    fdio::set_nonblocking(write_end.as_raw_fd())?;
    fdio::set_cloexec(read_end.as_raw_fd())?;
    fdio::set_cloexec(write_end.as_raw_fd())?;
    WAKE_FD.store(write_end.into_raw_fd(), Ordering::Relaxed);

    let restart = SigAction::new(
        SigHandler::Handler(on_child),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGCHLD, &restart)?;
        let term = SigAction::new(SigHandler::Handler(on_term), SaFlags::empty(), SigSet::empty());
        sigaction(Signal::SIGTERM, &term)?;
        sigaction(Signal::SIGINT, &term)?;
        sigaction(Signal::SIGHUP, &term)?;
        let notify =
            SigAction::new(SigHandler::Handler(on_notify), SaFlags::SA_RESTART, SigSet::empty());
        sigaction(Signal::SIGUSR2, &notify)?;
        let ready = SigAction::new(
            SigHandler::Handler(on_server_ready),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        sigaction(Signal::SIGUSR1, &ready)?;
    }
    Ok(read_end)
}

/// Reset every handled signal to its default disposition and clear the
/// mask. Called in child processes between fork and exec so children do
/// not inherit the slave's handlers or a nonempty mask.
///
/// Only async-signal-safe calls are made.
pub fn reset_in_child() {
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_DFL);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
        libc::signal(libc::SIGINT, libc::SIG_DFL);
        libc::signal(libc::SIGHUP, libc::SIG_DFL);
        libc::signal(libc::SIGUSR1, libc::SIG_DFL);
        libc::signal(libc::SIGUSR2, libc::SIG_DFL);
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
    }
}

/// Consume the SIGCHLD delivery flag.
pub fn take_child_pending() -> bool {
    CHILD_PENDING.swap(false, Ordering::Relaxed)
}

/// Whether a termination signal has been delivered. Sticky: termination is
/// terminal, the flag is never cleared.
pub fn term_pending() -> bool {
    TERM_PENDING.load(Ordering::Relaxed)
}

/// Consume the SIGUSR2 delivery flag.
pub fn take_notify_pending() -> bool {
    NOTIFY_PENDING.swap(false, Ordering::Relaxed)
}

/// Consume the X-server readiness flag (SIGUSR1).
pub fn take_server_ready() -> bool {
    SERVER_READY.swap(false, Ordering::Relaxed)
}

/// Arm the X-server readiness flag before a server spawn.
pub fn clear_server_ready() {
    SERVER_READY.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked_now(sig: Signal) -> bool {
        SigSet::thread_get_mask().expect("query mask").contains(sig)
    }

    #[test]
    fn push_pop_restores_mask() {
        assert!(!blocked_now(Signal::SIGCHLD));
        block_push(BlockClass::Child);
        assert!(blocked_now(Signal::SIGCHLD));
        block_pop(BlockClass::Child);
        assert!(!blocked_now(Signal::SIGCHLD));
    }

    #[test]
    fn nested_push_keeps_blocked_until_last_pop() {
        block_push(BlockClass::Notify);
        block_push(BlockClass::Notify);
        block_pop(BlockClass::Notify);
        assert!(blocked_now(Signal::SIGUSR2), "inner pop must not unblock");
        block_pop(BlockClass::Notify);
        assert!(!blocked_now(Signal::SIGUSR2));
    }

    #[test]
    #[should_panic(expected = "without matching push")]
    fn unbalanced_pop_panics() {
        block_pop(BlockClass::Terminate);
    }

    #[test]
    fn raii_guard_nests() {
        {
            let _outer = SignalBlock::new(BlockClass::Child);
            {
                let _inner = SignalBlock::new(BlockClass::Child);
                assert_eq!(block_depth(BlockClass::Child), 2);
            }
            assert!(blocked_now(Signal::SIGCHLD));
        }
        assert_eq!(block_depth(BlockClass::Child), 0);
        assert!(!blocked_now(Signal::SIGCHLD));
    }
}
