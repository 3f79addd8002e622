//! Owned child-process handles
//!
//! Every child the slave runs is held as a [`ChildHandle`]: the process,
//! its role and its process group, with exactly one way to make it go
//! away. No raw pids with `0` sentinels; an absent child is `None` in the
//! owning [`super::display::Display`] field.

use std::io;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::common::signals::{self, BlockClass, SignalBlock};

/// What a child is for. Drives the SIGCHLD reaction when it dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRole {
    /// The X server.
    Server,
    /// The greeter UI.
    Greeter,
    /// The chooser UI.
    Chooser,
    /// The user session.
    Session,
    /// Short-lived helpers (configurator, hooks).
    Extra,
}

/// An owned child process, usually in its own process group.
pub struct ChildHandle {
    role: ChildRole,
    child: Child,
    reaped: Option<ExitStatus>,
    own_group: bool,
}

impl ChildHandle {
    /// Spawn `cmd` as `role` in a fresh process group with default signal
    /// dispositions and an empty mask.
    ///
    /// SIGCHLD is blocked across the spawn so the handle is fully
    /// published before the death flag can ever refer to it.
    pub fn spawn(mut cmd: Command, role: ChildRole) -> io::Result<Self> {
        use std::os::unix::process::CommandExt;
        let _guard = SignalBlock::new(BlockClass::Child);
        // Child-side setup must stay async-signal-safe: setsid plus
        // handler resets, nothing that can allocate.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                signals::reset_in_child();
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        debug!(?role, pid = child.id(), "child spawned");
        Ok(Self { role, child, reaped: None, own_group: true })
    }

    /// Wrap a child that was already spawned elsewhere (the greeter,
    /// whose stdio the protocol channel had to capture first). Such a
    /// child shares the slave's process group, so signals go to the pid
    /// alone.
    pub fn adopt(child: Child, role: ChildRole) -> Self {
        debug!(?role, pid = child.id(), "child adopted");
        Self { role, child, reaped: None, own_group: false }
    }

    /// Role this child was spawned for.
    pub fn role(&self) -> ChildRole {
        self.role
    }

    /// Child pid.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Process group id (the child called setsid, so this is its pid).
    fn pgid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Take the piped stdout, when the command captured it.
    pub fn take_stdout(&mut self) -> Option<std::process::ChildStdout> {
        self.child.stdout.take()
    }

    /// Non-blocking reap. Remembers the status so repeated calls after
    /// death keep answering.
    pub fn try_reap(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.reaped {
            return Ok(Some(status));
        }
        match self.child.try_wait()? {
            Some(status) => {
                self.reaped = Some(status);
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// Blocking wait for this specific child.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.reaped {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.reaped = Some(status);
        Ok(status)
    }

    /// Send a signal to the whole process group (or the bare pid for
    /// adopted children that never got their own group).
    pub fn signal_group(&self, sig: Signal) {
        if self.reaped.is_some() {
            return;
        }
        let result = if self.own_group {
            killpg(self.pgid(), sig)
        } else {
            nix::sys::signal::kill(Pid::from_raw(self.child.id() as i32), sig)
        };
        if let Err(err) = result {
            debug!(pid = self.pid(), %err, "child signal failed");
        }
    }

    /// The single teardown path: SIGTERM to the group, bounded wait, then
    /// SIGKILL and a final wait so nothing is left unreaped.
    pub fn terminate_and_wait(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.reaped {
            return Ok(status);
        }
        debug!(role = ?self.role, pid = self.pid(), "terminating child");
        self.signal_group(Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.try_reap()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        warn!(role = ?self.role, pid = self.pid(), "child ignored SIGTERM, killing");
        self.signal_group(Signal::SIGKILL);
        let _ = self.child.kill();
        self.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sleep(secs: &str) -> ChildHandle {
        let mut cmd = Command::new("sleep");
        cmd.arg(secs);
        ChildHandle::spawn(cmd, ChildRole::Extra).expect("spawn sleep")
    }

    #[test]
    fn short_child_is_reaped() {
        let mut child = ChildHandle::spawn(Command::new("true"), ChildRole::Extra).unwrap();
        let status = child.wait().unwrap();
        assert!(status.success());
        // Repeated waits keep answering from the cached status.
        assert!(child.wait().unwrap().success());
        assert!(child.try_reap().unwrap().is_some());
    }

    #[test]
    fn terminate_kills_a_long_sleeper() {
        let mut child = spawn_sleep("60");
        let started = Instant::now();
        let status = child.terminate_and_wait(Duration::from_secs(5)).unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn try_reap_is_nonblocking_for_live_children() {
        let mut child = spawn_sleep("60");
        assert!(child.try_reap().unwrap().is_none());
        let _ = child.terminate_and_wait(Duration::from_secs(5));
    }
}
