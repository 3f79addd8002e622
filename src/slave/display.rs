//! Per-display state
//!
//! One [`Display`] value per slave process, exclusively owned and mutated
//! by its slave. It lives for the whole lifetime of the display; fields
//! that only make sense during one login are reset between logins, the
//! value itself is never recycled.

use std::path::PathBuf;
use std::time::Instant;

use crate::common::cookie::Cookie;
use crate::slave::child::ChildHandle;

/// How the display came to be managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayType {
    /// Statically configured local display.
    Local,
    /// Remote display managed through XDMCP.
    Xdmcp,
    /// On-demand local display.
    Flexi,
    /// On-demand nested server.
    FlexiNest,
}

impl DisplayType {
    /// Whether the X server runs on this machine.
    pub fn is_local(self) -> bool {
        !matches!(self, DisplayType::Xdmcp)
    }

    /// Whether this is an on-demand display that manages its own restarts.
    pub fn is_flexi(self) -> bool {
        matches!(self, DisplayType::Flexi | DisplayType::FlexiNest)
    }
}

/// Screen geometry used to place dialogs on multi-head setups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    /// Horizontal offset of the primary head.
    pub x: i32,
    /// Vertical offset of the primary head.
    pub y: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// One X display under management.
pub struct Display {
    /// Display name, e.g. `:0`.
    pub name: String,
    /// Remote hostname; `None` for local displays.
    pub hostname: Option<String>,
    /// Display number parsed from the name.
    pub number: u16,
    /// Display flavor.
    pub kind: DisplayType,
    /// Physically attached to this machine.
    pub console: bool,
    /// Kernel virtual terminal, when assigned.
    pub vt: Option<i32>,

    /// Current MIT-MAGIC-COOKIE.
    pub cookie: Option<Cookie>,
    /// Slave-owned authority file handed to the X server.
    pub authfile: Option<PathBuf>,
    /// Authority file owned by the logged-in user.
    pub userauth: Option<PathBuf>,

    /// Someone is logged in right now.
    pub logged_in: bool,
    /// Current login name.
    pub login: Option<String>,
    /// This display may run the timed-login countdown.
    pub timed_login_ok: bool,
    /// Run the chooser instead of the greeter (indirect queries).
    pub use_chooser: bool,
    /// Administratively disabled.
    pub disabled: bool,
    /// Dialog placement hints.
    pub geometry: Geometry,

    /// When the current incarnation started.
    pub last_start: Option<Instant>,
    /// Greeter restarts within this incarnation.
    pub retry_count: u32,
    /// Consecutive X server failures.
    pub x_faileds: u32,
    /// When the most recent X failure happened.
    pub last_x_failed: Option<Instant>,

    /// The X server child.
    pub server: Option<ChildHandle>,
    /// The greeter child.
    pub greeter: Option<ChildHandle>,
    /// The chooser child.
    pub chooser: Option<ChildHandle>,
    /// The user session child.
    pub session: Option<ChildHandle>,
}

impl Display {
    /// New display record. The number is parsed from the `:N` name.
    pub fn new(name: &str, kind: DisplayType, hostname: Option<String>) -> Self {
        let number = name
            .trim_start_matches(':')
            .split('.')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        Self {
            name: name.to_string(),
            hostname,
            number,
            kind,
            console: kind.is_local(),
            vt: None,
            cookie: None,
            authfile: None,
            userauth: None,
            logged_in: false,
            login: None,
            timed_login_ok: false,
            use_chooser: false,
            disabled: false,
            geometry: Geometry::default(),
            last_start: None,
            retry_count: 0,
            x_faileds: 0,
            last_x_failed: None,
            server: None,
            greeter: None,
            chooser: None,
            session: None,
        }
    }

    /// Clear login-scoped state between logins. Identity, counters and
    /// the server handle survive.
    pub fn reset_between_logins(&mut self) {
        self.logged_in = false;
        self.login = None;
        self.userauth = None;
        self.session = None;
    }

    /// Steady-state invariant: at most one of greeter, chooser and
    /// session is active outside the brief handoff windows.
    pub fn foreground_children(&self) -> usize {
        usize::from(self.greeter.is_some())
            + usize::from(self.chooser.is_some())
            + usize::from(self.session.is_some())
    }
}
