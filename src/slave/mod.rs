//! The per-display orchestrator
//!
//! [`Slave`] owns one display for its whole lifetime and walks it through
//! the phases: server start, greeter, login wait, session, and back,
//! until the display is handed back to the daemon through a process exit
//! status from [`ExitCode`].
//!
//! All cross-cutting state lives in this struct and is passed explicitly;
//! there are no file-scope globals beyond the async-signal flag words in
//! [`crate::common::signals`].

pub mod child;
pub mod chooser;
pub mod display;
pub mod server;
pub mod session;

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthBackend, AuthTarget, GreeterConverse, NullConverse, VerifyError};
use crate::common::{cookie, signals};
use crate::config::Config;
use crate::greeter::{GreeterChannel, Opcode};
use crate::relay::{DaemonCommand, DaemonMsg, NotifyEvent, Relay};
use child::{ChildHandle, ChildRole};
use display::{Display, DisplayType};

/// Exit-status contract between a slave and the daemon.
///
/// The daemon's supervisory loop branches on these values, so they are
/// wire constants, not an implementation detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Tear the display down and start it fresh.
    Remanage = 2,
    /// Give up on this display.
    Abort = 4,
    /// Reboot the machine.
    Reboot = 8,
    /// Halt the machine.
    Halt = 16,
    /// Suspend the machine.
    Suspend = 17,
    /// Chooser picked a host; restart the display pointed there.
    Chosen = 20,
    /// Run the chooser on the restarted display.
    RunChooser = 30,
    /// The X server is beyond saving.
    XFailed = 64,
    /// The greeter failed irrecoverably.
    GreeterFailed = 65,
    /// Restart only the greeter.
    RestartGreeter = 127,
    /// Restart the whole daemon.
    RestartDaemon = 128,
}

impl ExitCode {
    /// Raw process exit status.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    fn from_status(code: i32) -> Option<Self> {
        match code {
            2 => Some(Self::Remanage),
            4 => Some(Self::Abort),
            8 => Some(Self::Reboot),
            16 => Some(Self::Halt),
            17 => Some(Self::Suspend),
            20 => Some(Self::Chosen),
            30 => Some(Self::RunChooser),
            64 => Some(Self::XFailed),
            65 => Some(Self::GreeterFailed),
            127 => Some(Self::RestartGreeter),
            128 => Some(Self::RestartDaemon),
            _ => None,
        }
    }
}

/// How a server-start attempt ended.
enum ServerStart {
    /// Server up and connectable.
    Ready,
    /// Startup failed; recycle the incarnation and try again.
    Retry,
    /// The display is beyond saving.
    Fatal(ExitCode),
}

/// What ended one pass through the login-wait loop.
enum LoginWait {
    /// Interactive authentication succeeded.
    Login(String),
    /// The timed-login countdown fired for this user.
    Timed(String),
    /// The greeter process went away; its exit status decides what next.
    GreeterGone,
    /// The X server died.
    ServerDied,
    /// Termination was requested.
    Terminated,
}

/// Hot-reloadable policy mirror of the config keys the daemon can push.
struct LivePolicy {
    greeter_command: String,
    remote_greeter_command: String,
    timed_enable: bool,
    timed_user: String,
    timed_delay: u32,
    timed_allow_remote: bool,
}

/// The per-display slave process.
pub struct Slave {
    cfg: Config,
    display: Display,
    relay: Relay,
    backend: Box<dyn AuthBackend>,
    greeter: Option<GreeterChannel>,
    live: LivePolicy,
    remanage_asap: bool,
    autologin_available: bool,
    pending_greeter_message: Option<String>,
    session_id: Uuid,
    _wake_fd: OwnedFd,
}

impl Slave {
    /// Assemble a slave for one display.
    ///
    /// `first_display` marks the first display this daemon instance ever
    /// managed; only that one may consume the autologin privilege.
    pub fn new(cfg: Config, mut display: Display, relay: Relay, first_display: bool) -> Result<Self> {
        let wake_fd = signals::install().context("installing signal handlers")?;

        let policy = cfg.auth_policy();
        let backend = crate::auth::create_backend(
            &cfg.auth.backend,
            policy,
            &cfg.auth.pam_service,
            &cfg.auth.pam_autologin_service,
        )?;
        let dname = &display.name;
        info!(backend = backend.name(), display = %dname, "auth backend ready");

        display.timed_login_ok = first_display && display.kind.is_local();
        let autologin_available = cfg.autologin.enable
            && first_display
            && display.kind == DisplayType::Local
            && !cfg.autologin.user.is_empty();

        let live = LivePolicy {
            greeter_command: cfg.greeter.command.clone(),
            remote_greeter_command: cfg.greeter.remote_command.clone(),
            timed_enable: cfg.autologin.timed_enable,
            timed_user: cfg.autologin.timed_user.clone(),
            timed_delay: cfg.autologin.timed_delay,
            timed_allow_remote: cfg.autologin.allow_remote,
        };

        Ok(Self {
            cfg,
            display,
            relay,
            backend,
            greeter: None,
            live,
            remanage_asap: false,
            autologin_available,
            pending_greeter_message: None,
            session_id: Uuid::new_v4(),
            _wake_fd: wake_fd,
        })
    }

    fn auth_target(&self) -> AuthTarget {
        AuthTarget { display: self.display.name.clone(), hostname: self.display.hostname.clone() }
    }

    fn is_local(&self) -> bool {
        self.display.kind.is_local()
    }

    fn term_exit_code(&self) -> ExitCode {
        if self.display.kind == DisplayType::Local {
            ExitCode::Remanage
        } else {
            ExitCode::Abort
        }
    }

    /// Main entry: loop display incarnations until a terminal status.
    pub fn start(mut self) -> ExitCode {
        info!(
            display = %self.display.name,
            session = %self.session_id,
            kind = ?self.display.kind,
            "slave starting"
        );
        loop {
            match self.run_once() {
                Ok(Some(code)) => {
                    info!(display = %self.display.name, ?code, "slave exiting");
                    return code;
                }
                Ok(None) => {
                    debug!(display = %self.display.name, "recycling display incarnation");
                    self.stop_server();
                }
                Err(err) => {
                    error!(display = %self.display.name, %err, "slave failed");
                    return self.teardown(ExitCode::Abort);
                }
            }
        }
    }

    /// One display incarnation: X server up, one login/session cycle.
    ///
    /// `Ok(None)` means recycle (restart the server and go again);
    /// `Ok(Some(code))` ends the slave.
    fn run_once(&mut self) -> Result<Option<ExitCode>> {
        self.process_notifications();
        if signals::term_pending() {
            let code = self.term_exit_code();
            return Ok(Some(self.teardown(code)));
        }

        match self.start_server() {
            ServerStart::Ready => {}
            ServerStart::Retry => return Ok(None),
            ServerStart::Fatal(code) => return Ok(Some(code)),
        }

        if self.display.use_chooser {
            return self.run_chooser().map(Some);
        }

        // The autologin privilege is consumed on the attempt, not on its
        // success; otherwise a broken session would retrigger autologin
        // in an endless loop.
        if self.autologin_available {
            self.autologin_available = false;
            let user = self.cfg.autologin.user.clone();
            info!(%user, "attempting automatic login");
            let target = self.auth_target();
            let mut conv = NullConverse;
            match self.backend.setup_autologin_session(&mut conv, &user, &target) {
                Ok(login) => {
                    self.run_session(&login, true)?;
                    if self.remanage_asap {
                        return Ok(Some(self.teardown(ExitCode::Remanage)));
                    }
                    return Ok(None);
                }
                Err(err) => {
                    warn!(%user, %err, "automatic login failed, falling back to greeter");
                    self.backend.cleanup();
                }
            }
        }

        // Login loop: greeter attempts until a session runs or the
        // incarnation dies.
        loop {
            self.process_notifications();
            if signals::term_pending() {
                let code = self.term_exit_code();
                return Ok(Some(self.teardown(code)));
            }
            if self.remanage_asap && !self.display.logged_in {
                return Ok(Some(self.teardown(ExitCode::Remanage)));
            }

            if self.greeter.is_none() {
                if let Err(err) = self.start_greeter() {
                    // Spawn failure for a core child is fatal to the
                    // display, not something to retry in a tight loop.
                    error!(%err, "could not start greeter");
                    return Ok(Some(self.teardown(ExitCode::GreeterFailed)));
                }
            }

            match self.wait_for_login()? {
                LoginWait::Login(login) => {
                    self.stop_greeter();
                    self.run_session(&login, false)?;
                    if self.remanage_asap {
                        return Ok(Some(self.teardown(ExitCode::Remanage)));
                    }
                    return Ok(None);
                }
                LoginWait::Timed(user) => {
                    info!(%user, "timed login triggered");
                    let target = self.auth_target();
                    self.backend.set_quiet(true);
                    let mut conv = NullConverse;
                    let result = self.backend.setup_autologin_session(&mut conv, &user, &target);
                    self.backend.set_quiet(false);
                    match result {
                        Ok(login) => {
                            self.stop_greeter();
                            self.run_session(&login, true)?;
                            if self.remanage_asap {
                                return Ok(Some(self.teardown(ExitCode::Remanage)));
                            }
                            return Ok(None);
                        }
                        Err(err) => {
                            warn!(%user, %err, "timed login failed");
                            self.backend.cleanup();
                            if let Some(chan) = self.greeter.as_mut() {
                                chan.ctl_noret(Opcode::ErrBox, "\nThe automatic login failed.");
                                chan.ctl_noret(Opcode::ResetOk, "");
                            }
                        }
                    }
                }
                LoginWait::GreeterGone => {
                    if let Some(code) = self.handle_greeter_death()? {
                        return Ok(Some(self.teardown(code)));
                    }
                }
                LoginWait::ServerDied => {
                    warn!(display = %self.display.name, "X server died under the greeter");
                    self.stop_greeter();
                    if server::note_failure(&mut self.display, &self.cfg.server, Instant::now()) {
                        return Ok(Some(self.teardown(ExitCode::XFailed)));
                    }
                    return Ok(None);
                }
                LoginWait::Terminated => {
                    let code = self.term_exit_code();
                    return Ok(Some(self.teardown(code)));
                }
            }
        }
    }

    fn start_server(&mut self) -> ServerStart {
        match server::start(&mut self.display, &self.cfg.server, &self.cfg.daemon.auth_dir) {
            Ok(()) => {
                self.display.x_faileds = 0;
                let xpid = self.display.server.as_ref().map_or(0, ChildHandle::pid);
                self.relay.send_lossy(&DaemonMsg::XPid(xpid), false);
                self.relay.send_lossy(&DaemonMsg::DispNum(self.display.number), false);
                if let Some(cookie) = &self.display.cookie {
                    self.relay.send_lossy(&DaemonMsg::Cookie(cookie.to_hex()), true);
                }
                if let Some(vt) = self.display.vt {
                    self.relay.send_lossy(&DaemonMsg::VtNum(vt), false);
                }
                if self.display.kind.is_flexi() {
                    self.relay.send_lossy(&DaemonMsg::FlexiOk, true);
                }
                ServerStart::Ready
            }
            Err(err) => {
                warn!(display = %self.display.name, %err, "X server startup failed");
                if server::note_failure(&mut self.display, &self.cfg.server, Instant::now()) {
                    if self.display.kind.is_flexi() {
                        self.relay.send_lossy(&DaemonMsg::FlexiErr(3), false);
                    }
                    return ServerStart::Fatal(self.teardown(ExitCode::XFailed));
                }
                std::thread::sleep(Duration::from_secs(1));
                ServerStart::Retry
            }
        }
    }

    fn run_chooser(&mut self) -> Result<ExitCode> {
        match chooser::run(&self.display, &self.cfg.chooser)? {
            Some(host) => {
                info!(%host, "chooser picked a host");
                self.relay.send_lossy(&DaemonMsg::ChosenLocal(host), true);
                Ok(self.teardown(ExitCode::Chosen))
            }
            None => Ok(self.teardown(ExitCode::Remanage)),
        }
    }

    /// Spawn the greeter and wire up the control channel.
    fn start_greeter(&mut self) -> Result<()> {
        let command = if self.is_local() {
            &self.live.greeter_command
        } else {
            &self.live.remote_greeter_command
        };
        let mut argv = command.split_whitespace();
        let program = argv.next().context("greeter command is empty")?;

        let mut cmd = std::process::Command::new(program);
        cmd.args(argv);
        cmd.env("DISPLAY", &self.display.name);
        if let Some(authfile) = &self.display.authfile {
            cmd.env("XAUTHORITY", authfile);
        }
        cmd.env("RUNNING_UNDER_GDM", "true");

        let guard = signals::SignalBlock::new(signals::BlockClass::Child);
        let (child, chan) = GreeterChannel::spawn(cmd).context("spawning greeter")?;
        let handle = ChildHandle::adopt(child, ChildRole::Greeter);
        drop(guard);

        self.relay.send_lossy(&DaemonMsg::GreetPid(handle.pid()), false);
        self.display.greeter = Some(handle);
        self.display.retry_count += 1;
        let mut chan = chan;
        if let Some(msg) = self.pending_greeter_message.take() {
            chan.ctl_noret(Opcode::ErrBox, &msg);
        }
        self.serve_user_picture(&mut chan);
        self.greeter = Some(chan);
        info!(display = %self.display.name, "greeter running");
        Ok(())
    }

    /// Face-browser support: the greeter may ask for one user's picture
    /// right after startup. Every failure here is advisory; a missing
    /// photo must never hold up the login screen.
    fn serve_user_picture(&self, chan: &mut GreeterChannel) {
        let Some(wanted) = chan.ctl(Opcode::NeedPic, "") else { return };
        let Some(user) = session::resolve_user(&wanted) else {
            chan.ctl_noret(Opcode::ReadPic, "");
            return;
        };
        let photo = user.dir.join(".face");
        let staged = self.cfg.daemon.auth_dir.join(format!("photo-{}", self.session_id));
        match std::fs::copy(&photo, &staged) {
            Ok(_) => {
                let _ = std::fs::set_permissions(
                    &staged,
                    std::os::unix::fs::PermissionsExt::from_mode(0o644),
                );
                chan.ctl_noret(Opcode::ReadPic, &staged.display().to_string());
                let _ = std::fs::remove_file(&staged);
            }
            Err(err) => {
                debug!(user = %wanted, %err, "no user picture available");
                chan.ctl_noret(Opcode::ReadPic, "");
            }
        }
    }

    /// Quit the greeter politely, then make sure it is gone.
    fn stop_greeter(&mut self) {
        if let Some(mut chan) = self.greeter.take() {
            chan.quit();
        }
        if let Some(mut handle) = self.display.greeter.take() {
            let _ = handle.terminate_and_wait(Duration::from_secs(5));
            self.relay.send_lossy(&DaemonMsg::GreetPid(0), false);
        }
    }

    /// Tear down and relaunch the greeter, preserving queued
    /// notifications (they live in the relay, not the channel).
    fn restart_greeter(&mut self) -> Result<()> {
        info!(display = %self.display.name, "restarting greeter");
        self.stop_greeter();
        self.start_greeter()
    }

    fn timed_login_possible(&self) -> bool {
        (self.display.console || self.live.timed_allow_remote)
            && self.display.timed_login_ok
            && self.live.timed_enable
            && !self.live.timed_user.is_empty()
            && self.live.timed_user != "root"
            && self.live.timed_delay > 0
    }

    /// The login-wait loop: drive the backend through the greeter until
    /// something decisive happens.
    fn wait_for_login(&mut self) -> Result<LoginWait> {
        loop {
            self.process_notifications();
            if signals::term_pending() {
                return Ok(LoginWait::Terminated);
            }
            match self.check_children() {
                Some(ChildRole::Server) => return Ok(LoginWait::ServerDied),
                Some(ChildRole::Greeter) => return Ok(LoginWait::GreeterGone),
                _ => {}
            }

            let target = self.auth_target();
            let local = self.is_local();
            let timer_ok = self.timed_login_possible();

            // Key-change notifications must not mutate policy under an
            // in-flight conversation; they queue until this attempt is
            // over.
            self.relay.notify.disable();
            let Slave { backend, greeter, relay, .. } = &mut *self;
            let result = match greeter.as_mut() {
                Some(chan) => {
                    let mut conv = GreeterConverse::new(chan, timer_ok);
                    backend.verify_user(&mut conv, None, &target, local)
                }
                None => {
                    relay.notify.enable();
                    return Ok(LoginWait::GreeterGone);
                }
            };
            self.relay.notify.enable();

            let (flags, greeter_alive) = match self.greeter.as_mut() {
                Some(chan) => {
                    chan.take_interrupted();
                    (chan.take_flags(), chan.alive())
                }
                None => return Ok(LoginWait::GreeterGone),
            };

            if flags.suspend_requested {
                self.relay.send_lossy(&DaemonMsg::SuspendMachine, false);
            }
            if let Some(lang) = flags.selected_language {
                info!(%lang, "language selected, restarting greeter");
                self.backend.cleanup();
                self.pending_greeter_message = None;
                self.restart_greeter()?;
                continue;
            }
            if flags.do_configurator {
                self.backend.cleanup();
                self.run_configurator()?;
                continue;
            }
            if flags.do_timed_login {
                self.backend.cleanup();
                if self.timed_login_possible() {
                    return Ok(LoginWait::Timed(self.live.timed_user.clone()));
                }
                debug!("timed-login interrupt ignored, not permitted here");
                continue;
            }
            if flags.do_cancel {
                debug!("login attempt cancelled");
                self.backend.cleanup();
                if let Some(chan) = self.greeter.as_mut() {
                    chan.ctl_noret(Opcode::ResetOk, "");
                }
                continue;
            }
            if let Some(user) = flags.selected_user {
                debug!(%user, "user selected from browser, retrying with preset login");
                self.backend.cleanup();
                let outcome = self.verify_preset(&user)?;
                if let Some(wait) = outcome {
                    return Ok(wait);
                }
                continue;
            }

            match result {
                Ok(login) => {
                    if let Some(chan) = self.greeter.as_mut() {
                        chan.ctl_noret(Opcode::Enable, "");
                        chan.ctl_noret(Opcode::ResetOk, "");
                    }
                    return Ok(LoginWait::Login(login));
                }
                Err(VerifyError::Interrupted) => {
                    if !greeter_alive {
                        return Ok(LoginWait::GreeterGone);
                    }
                    continue;
                }
                Err(err) => {
                    debug!(%err, "login attempt failed");
                    // Failure text already went to the greeter; shake and
                    // re-enter the loop.
                    if let Some(chan) = self.greeter.as_mut() {
                        chan.ctl_noret(Opcode::Reset, "");
                    }
                    continue;
                }
            }
        }
    }

    /// One verification pass with a preset username (face browser pick).
    fn verify_preset(&mut self, user: &str) -> Result<Option<LoginWait>> {
        let target = self.auth_target();
        let local = self.is_local();
        self.relay.notify.disable();
        let Slave { backend, greeter, relay, .. } = &mut *self;
        let result = match greeter.as_mut() {
            Some(chan) => {
                let mut conv = GreeterConverse::new(chan, false);
                backend.verify_user(&mut conv, Some(user), &target, local)
            }
            None => {
                relay.notify.enable();
                return Ok(Some(LoginWait::GreeterGone));
            }
        };
        self.relay.notify.enable();
        match result {
            Ok(login) => Ok(Some(LoginWait::Login(login))),
            Err(_) => {
                if let Some(chan) = self.greeter.as_mut() {
                    chan.ctl_noret(Opcode::Reset, "");
                }
                Ok(None)
            }
        }
    }

    /// The configurator diversion.
    ///
    /// Always demands a fresh root verification, even when the requesting
    /// user is already root. The second check is deliberate defense in
    /// depth and must not be optimized away.
    fn run_configurator(&mut self) -> Result<()> {
        if !self.cfg.security.configurator_enabled {
            if let Some(chan) = self.greeter.as_mut() {
                chan.ctl_noret(Opcode::ErrBox, "\nThe configurator is not available on this display.");
            }
            return Ok(());
        }

        info!("configurator requested, verifying root");
        let target = self.auth_target();
        let local = self.is_local();
        self.relay.notify.disable();
        let Slave { backend, greeter, relay, .. } = &mut *self;
        let result = match greeter.as_mut() {
            Some(chan) => {
                chan.ctl_noret(Opcode::SetLogin, "root");
                let mut conv = GreeterConverse::new(chan, false);
                backend.verify_user(&mut conv, Some("root"), &target, local)
            }
            None => {
                relay.notify.enable();
                return Ok(());
            }
        };
        self.relay.notify.enable();

        match result {
            Ok(_) => {
                // Root session state is not wanted, only the verification.
                self.backend.cleanup();
                if let Some(chan) = self.greeter.as_mut() {
                    chan.ctl_noret(Opcode::Disable, "");
                }
                self.spawn_configurator();
                self.restart_greeter()?;
            }
            Err(err) => {
                debug!(%err, "configurator authentication failed");
                self.backend.cleanup();
                if let Some(chan) = self.greeter.as_mut() {
                    chan.ctl_noret(Opcode::SetLogin, "");
                    chan.ctl_noret(Opcode::Reset, "");
                }
            }
        }
        Ok(())
    }

    fn spawn_configurator(&mut self) {
        let command = self.cfg.security.configurator_command.clone();
        let mut argv = command.split_whitespace();
        let Some(program) = argv.next() else { return };
        let mut cmd = std::process::Command::new(program);
        cmd.args(argv);
        cmd.env("DISPLAY", &self.display.name);
        if let Some(authfile) = &self.display.authfile {
            cmd.env("XAUTHORITY", authfile);
        }
        match ChildHandle::spawn(cmd, ChildRole::Extra) {
            Ok(mut handle) => {
                info!(pid = handle.pid(), "configurator running");
                match handle.wait() {
                    Ok(status) => debug!(?status, "configurator finished"),
                    Err(err) => warn!(%err, "configurator wait failed"),
                }
            }
            Err(err) => {
                warn!(%err, "could not run configurator");
            }
        }
    }

    /// Run one user session to completion.
    fn run_session(&mut self, login: &str, autologin: bool) -> Result<()> {
        let Some(user) = session::resolve_user(login) else {
            error!(login, "no passwd entry for verified login");
            self.backend.cleanup();
            return Ok(());
        };

        let mut home: PathBuf = user.dir.clone();
        if !session::home_usable(&home) {
            warn!(login, home = %home.display(), "home directory unusable");
            if !self.offer_root_home_fallback(login) {
                self.backend.cleanup();
                return Ok(());
            }
            home = PathBuf::from("/");
        }

        // Per-user authority file for the X clients in the session.
        if let Some(cookie) = &self.display.cookie {
            let userauth = if home == std::path::Path::new("/") {
                let _ = std::fs::create_dir_all(&self.cfg.daemon.user_auth_fallback_dir);
                self.cfg.daemon.user_auth_fallback_dir.join(format!("{}.auth", self.session_id))
            } else {
                home.join(".Xauthority")
            };
            match cookie::write_user_auth(
                &userauth,
                self.display.number,
                cookie,
                user.uid.as_raw(),
                user.gid.as_raw(),
            ) {
                Ok(()) => self.display.userauth = Some(userauth),
                Err(err) => warn!(%err, "could not write user authority file"),
            }
        }

        self.display.login = Some(login.to_string());
        self.display.logged_in = true;
        self.relay.send_lossy(&DaemonMsg::LoggedIn(true), false);
        self.relay.send_lossy(&DaemonMsg::Login(login.to_string()), false);

        if !autologin {
            self.stop_greeter();
        }

        let backend_env = self.backend.session_env();
        let spec = session::SessionSpec {
            user: &user,
            command: &self.cfg.session.command,
            session_name: &self.cfg.session.default_session,
            backend_env: &backend_env,
            lang: None,
            failsafe: false,
        };

        let started = Instant::now();
        let outcome = session::spawn(&self.display, &spec, &self.cfg.session.default_path, &home);
        match outcome {
            Ok(handle) => {
                self.relay.send_lossy(&DaemonMsg::SessPid(handle.pid()), false);
                self.display.session = Some(handle);
                let status = self.supervise_session();
                let duration = started.elapsed();
                session::log_session_end(login, status, duration);

                if session::ended_too_fast(duration) && status != Some(0) {
                    warn!(login, "session ended almost immediately");
                    let msg = session::crash_message(false, &home);
                    if let Some(tail) = session::session_errors_tail(&home, 4096) {
                        debug!(%tail, "session error capture");
                    }
                    self.pending_greeter_message = Some(msg);
                }
            }
            Err(err) => {
                error!(login, %err, "could not start session");
                self.try_failsafe(&user, &backend_env, &home, started);
            }
        }

        self.display.reset_between_logins();
        self.relay.send_lossy(&DaemonMsg::SessPid(0), false);
        self.relay.send_lossy(&DaemonMsg::LoggedIn(false), false);
        self.relay.send_lossy(&DaemonMsg::Login(String::new()), false);
        self.backend.cleanup();
        Ok(())
    }

    /// Last resort: a bare failsafe session so the user is not locked
    /// out entirely.
    fn try_failsafe(&mut self, user: &nix::unistd::User, backend_env: &[(String, String)], home: &std::path::Path, started: Instant) {
        let spec = session::SessionSpec {
            user,
            command: &self.cfg.session.failsafe_command,
            session_name: "failsafe",
            backend_env,
            lang: None,
            failsafe: true,
        };
        match session::spawn(&self.display, &spec, &self.cfg.session.default_path, home) {
            Ok(handle) => {
                self.relay.send_lossy(&DaemonMsg::SessPid(handle.pid()), false);
                self.display.session = Some(handle);
                let status = self.supervise_session();
                session::log_session_end(&user.name, status, started.elapsed());
            }
            Err(err) => {
                error!(%err, "failsafe session failed too");
            }
        }
    }

    /// Wait for the running session, reacting to termination requests and
    /// server death while it runs.
    fn supervise_session(&mut self) -> Option<i32> {
        loop {
            if signals::term_pending() {
                info!("termination requested, stopping session");
                if let Some(mut sess) = self.display.session.take() {
                    let _ = sess.terminate_and_wait(Duration::from_secs(10));
                }
                return None;
            }
            signals::take_child_pending();

            if let Some(sess) = self.display.session.as_mut() {
                match sess.try_reap() {
                    Ok(Some(status)) => {
                        self.display.session = None;
                        return status.code();
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(%err, "session wait failed");
                        self.display.session = None;
                        return None;
                    }
                }
            } else {
                return None;
            }

            if let Some(server) = self.display.server.as_mut() {
                if let Ok(Some(status)) = server.try_reap() {
                    warn!(?status, "X server died during session, stopping session");
                    self.display.server = None;
                    self.relay.send_lossy(&DaemonMsg::XPid(0), false);
                    if let Some(mut sess) = self.display.session.take() {
                        let _ = sess.terminate_and_wait(Duration::from_secs(10));
                    }
                    return None;
                }
            }

            std::thread::sleep(Duration::from_millis(200));
        }
    }

    /// Ask whether to log in with `/` as home. Without a live greeter the
    /// answer is no.
    fn offer_root_home_fallback(&mut self, login: &str) -> bool {
        let Some(chan) = self.greeter.as_mut() else { return false };
        chan.ctl_noret(
            Opcode::ErrBox,
            "\nYour home directory is not usable. The session can start with / as your home directory.",
        );
        let answer = chan.ctl(Opcode::Prompt, "Log in anyway? (yes/no)");
        let yes = matches!(answer.as_deref(), Some("yes") | Some("y"));
        if !yes {
            debug!(login, "user declined root-home fallback");
        }
        yes
    }

    /// Non-blocking child sweep: which tracked child died?
    fn check_children(&mut self) -> Option<ChildRole> {
        if !signals::take_child_pending() {
            return None;
        }
        if let Some(server) = self.display.server.as_mut() {
            if let Ok(Some(status)) = server.try_reap() {
                debug!(?status, "X server exited");
                self.display.server = None;
                self.relay.send_lossy(&DaemonMsg::XPid(0), false);
                return Some(ChildRole::Server);
            }
        }
        if let Some(greeter) = self.display.greeter.as_mut() {
            if let Ok(Some(status)) = greeter.try_reap() {
                debug!(?status, "greeter exited");
                return Some(ChildRole::Greeter);
            }
        }
        None
    }

    /// Map a greeter death to the follow-up action. `None` means the
    /// greeter was restarted and the loop continues.
    fn handle_greeter_death(&mut self) -> Result<Option<ExitCode>> {
        let status = match self.display.greeter.as_mut() {
            Some(handle) => handle.try_reap().ok().flatten(),
            None => None,
        };
        self.greeter = None;
        self.display.greeter = None;
        self.relay.send_lossy(&DaemonMsg::GreetPid(0), false);
        self.backend.cleanup();

        let code = status.and_then(|s| s.code());
        match code.and_then(ExitCode::from_status) {
            Some(ExitCode::RestartGreeter) => {
                self.restart_greeter()?;
                Ok(None)
            }
            Some(action @ (ExitCode::Abort | ExitCode::Reboot | ExitCode::Halt | ExitCode::Suspend | ExitCode::RestartDaemon)) => {
                info!(?action, "greeter requested structured action");
                Ok(Some(action))
            }
            Some(other) => {
                debug!(?other, "greeter exit treated as remanage");
                Ok(Some(ExitCode::Remanage))
            }
            None => {
                // Unrecognized status: assume a crash and remanage fresh.
                warn!(?code, "greeter died unexpectedly");
                Ok(Some(ExitCode::Remanage))
            }
        }
    }

    /// Drain the notify pipe and apply whatever is ready.
    fn process_notifications(&mut self) {
        self.relay.notify.drain();
        while let Some(event) = self.relay.notify.next_event() {
            match event {
                NotifyEvent::KeyChanged { key, value } => self.apply_key_change(&key, &value),
                NotifyEvent::Command(DaemonCommand::DirtyServers) => {
                    if !self.display.kind.is_flexi() {
                        self.remanage_asap = true;
                    }
                }
                NotifyEvent::Command(DaemonCommand::SoftRestartServers) => {
                    if !self.display.kind.is_flexi() {
                        self.remanage_asap = true;
                    }
                }
                NotifyEvent::Command(DaemonCommand::Go) => {
                    debug!("daemon released the startup gate");
                }
            }
        }
    }

    fn apply_key_change(&mut self, key: &str, value: &str) {
        debug!(key, value, "applying configuration change");
        let as_bool = || matches!(value, "1" | "true" | "TRUE");
        match key {
            "AllowRoot" => self.cfg.security.allow_root = as_bool(),
            "AllowRemoteRoot" => self.cfg.security.allow_remote_root = as_bool(),
            "AllowRemoteAutoLogin" => self.live.timed_allow_remote = as_bool(),
            "RetryDelay" => {
                if let Ok(secs) = value.parse() {
                    self.cfg.security.retry_delay = secs;
                }
            }
            "Greeter" => self.live.greeter_command = value.to_string(),
            "RemoteGreeter" => self.live.remote_greeter_command = value.to_string(),
            "TimedLogin" => self.live.timed_user = value.to_string(),
            "TimedLoginEnable" => self.live.timed_enable = as_bool(),
            "TimedLoginDelay" => {
                if let Ok(delay) = value.parse() {
                    self.live.timed_delay = delay;
                }
            }
            other => {
                debug!(key = other, "unhandled configuration key");
            }
        }
        self.backend.set_policy(self.cfg.auth_policy());
    }

    fn stop_server(&mut self) {
        if let Some(mut server) = self.display.server.take() {
            let _ = server.terminate_and_wait(Duration::from_secs(10));
            self.relay.send_lossy(&DaemonMsg::XPid(0), false);
        }
    }

    /// Kill every owned child, close the backend session, report the
    /// final state and produce the exit code.
    fn teardown(&mut self, code: ExitCode) -> ExitCode {
        debug!(display = %self.display.name, ?code, "tearing down");
        if let Some(mut sess) = self.display.session.take() {
            let _ = sess.terminate_and_wait(Duration::from_secs(10));
        }
        self.stop_greeter();
        if let Some(mut chooser) = self.display.chooser.take() {
            let _ = chooser.terminate_and_wait(Duration::from_secs(5));
        }
        self.stop_server();
        self.backend.cleanup();
        if self.display.logged_in {
            self.display.logged_in = false;
            self.relay.send_lossy(&DaemonMsg::LoggedIn(false), false);
            self.relay.send_lossy(&DaemonMsg::Login(String::new()), false);
        }
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_daemon_contract() {
        assert_eq!(ExitCode::Remanage.as_i32(), 2);
        assert_eq!(ExitCode::Abort.as_i32(), 4);
        assert_eq!(ExitCode::Reboot.as_i32(), 8);
        assert_eq!(ExitCode::Halt.as_i32(), 16);
        assert_eq!(ExitCode::Suspend.as_i32(), 17);
        assert_eq!(ExitCode::Chosen.as_i32(), 20);
        assert_eq!(ExitCode::RunChooser.as_i32(), 30);
        assert_eq!(ExitCode::XFailed.as_i32(), 64);
        assert_eq!(ExitCode::GreeterFailed.as_i32(), 65);
        assert_eq!(ExitCode::RestartGreeter.as_i32(), 127);
        assert_eq!(ExitCode::RestartDaemon.as_i32(), 128);
    }

    #[test]
    fn exit_code_roundtrip_from_status() {
        for code in [
            ExitCode::Remanage,
            ExitCode::Abort,
            ExitCode::Reboot,
            ExitCode::Halt,
            ExitCode::Suspend,
            ExitCode::Chosen,
            ExitCode::RunChooser,
            ExitCode::XFailed,
            ExitCode::GreeterFailed,
            ExitCode::RestartGreeter,
            ExitCode::RestartDaemon,
        ] {
            assert_eq!(ExitCode::from_status(code.as_i32()), Some(code));
        }
        assert_eq!(ExitCode::from_status(0), None);
        assert_eq!(ExitCode::from_status(1), None);
    }
}
