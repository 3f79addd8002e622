//! Daemon notification relay
//!
//! Two directions, two very different shapes:
//!
//! * outbound: newline-framed text messages into the daemon's well-known
//!   FIFO ([`outbound::DaemonLink`]);
//! * inbound: SIGUSR2 plus a private notify pipe, drained at safe points
//!   into acks and queued notifications ([`inbound::NotifyQueue`]).
//!
//! The [`Relay`] facade couples the two because acknowledgements for
//! outbound messages arrive on the inbound pipe.

pub mod inbound;
pub mod indirect;
pub mod outbound;

use std::io;
use std::os::fd::AsFd;

use tracing::{debug, warn};

use crate::common::fdio;
pub use inbound::{DaemonCommand, NotifyEvent, NotifyQueue};
pub use indirect::IndirectLedger;
pub use outbound::{DaemonLink, DaemonMsg};

/// How many one-second ack polls an outbound send will wait.
const ACK_POLLS: u32 = 10;

/// Combined daemon channel used by the orchestrator.
pub struct Relay {
    /// Outbound FIFO link.
    pub link: DaemonLink,
    /// Inbound notify queue.
    pub notify: NotifyQueue,
}

impl Relay {
    /// Build a relay from its two halves.
    pub fn new(link: DaemonLink, notify: NotifyQueue) -> Self {
        Self { link, notify }
    }

    /// Send a message, optionally waiting (bounded) for the daemon's ack.
    ///
    /// `wait_ack` must be false when called anywhere near signal context;
    /// the wait is a sequence of one-second polls on the notify pipe, and
    /// an ack that never arrives is logged rather than treated as fatal.
    pub fn send(&mut self, msg: &DaemonMsg, wait_ack: bool) -> io::Result<()> {
        if wait_ack {
            self.notify.clear_ack();
        }
        self.link.send(msg)?;
        if !wait_ack {
            return Ok(());
        }

        for _ in 0..ACK_POLLS {
            self.notify.drain();
            if self.notify.got_ack() {
                return Ok(());
            }
            match self.notify.fd() {
                Some(fd) => {
                    let _ = fdio::wait_readable(fd.as_fd(), 1000)?;
                }
                None => std::thread::sleep(std::time::Duration::from_secs(1)),
            }
            if crate::common::signals::term_pending() {
                break;
            }
        }
        self.notify.drain();
        if !self.notify.got_ack() {
            warn!(?msg, "no ack from daemon within bound, continuing");
        } else {
            debug!(?msg, "ack received");
        }
        Ok(())
    }

    /// Send and log (not propagate) any failure. Fire-and-forget variant
    /// for status updates where the display must keep running even when
    /// the daemon is briefly unreachable.
    pub fn send_lossy(&mut self, msg: &DaemonMsg, wait_ack: bool) {
        if let Err(err) = self.send(msg, wait_ack) {
            warn!(%err, ?msg, "failed to notify daemon");
        }
    }
}
