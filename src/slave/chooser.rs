//! Chooser runs
//!
//! For indirect remote displays the slave runs the chooser instead of the
//! greeter. The chooser prints its pick as the final line on stdout and
//! exits; the slave forwards the host to the daemon and terminates the
//! incarnation with the chosen status.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use tracing::{info, warn};

use crate::config::ChooserConfig;
use crate::slave::child::{ChildHandle, ChildRole};
use crate::slave::display::Display;

/// Run the chooser to completion and return the chosen hostname, if any.
pub fn run(display: &Display, cfg: &ChooserConfig) -> std::io::Result<Option<String>> {
    let mut argv = cfg.command.split_whitespace();
    let Some(program) = argv.next() else {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty chooser command"));
    };

    let mut cmd = Command::new(program);
    cmd.args(argv);
    cmd.env("DISPLAY", &display.name);
    if let Some(authfile) = &display.authfile {
        cmd.env("XAUTHORITY", authfile);
    }
    cmd.stdout(Stdio::piped());

    let mut handle = ChildHandle::spawn(cmd, ChildRole::Chooser)?;
    let dname = &display.name;
    info!(display = %dname, pid = handle.pid(), "chooser started");

    // The protocol is one hostname per line, last line wins; everything
    // else the chooser prints is ignored.
    let chosen = match handle.take_stdout() {
        Some(stdout) => {
            let reader = BufReader::new(stdout);
            let mut chosen = None;
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        let line = line.trim().to_string();
                        if !line.is_empty() {
                            chosen = Some(line);
                        }
                    }
                    Err(err) => {
                        warn!(%err, "chooser output read failed");
                        break;
                    }
                }
            }
            chosen
        }
        None => None,
    };

    let status = handle.wait()?;
    if !status.success() {
        let dname = &display.name;
        warn!(display = %dname, ?status, "chooser exited with failure");
        return Ok(None);
    }
    Ok(chosen)
}
