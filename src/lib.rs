//! # luxdm
//!
//! Display manager slave core: the per-display process that supervises an
//! X server, authenticates users and runs their sessions.
//!
//! The parent daemon forks one slave per managed display. The slave owns
//! everything that happens on that display until it is torn down:
//!
//! ```text
//! luxdm-slave (root)
//!   ├─> X server        (spawned, readiness-gated, restarted on failure)
//!   ├─> greeter         (unprivileged UI, wire protocol over a pipe pair)
//!   ├─> chooser         (remote-host picker, optional)
//!   ├─> user session    (privileges dropped to the target user)
//!   └─> daemon relay    (FIFO out, SIGUSR2 + notify pipe in)
//! ```
//!
//! # Concurrency model
//!
//! Strictly single-threaded and signal-driven. Concurrency is entirely
//! inter-process; signal handlers only set atomic flags and write a wake
//! byte, and all real work happens at safe points in the main control flow.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Authentication backends (PAM, crypt/shadow) behind a common trait.
pub mod auth;

/// Low-level signal, fd and cookie primitives.
pub mod common;

/// Slave configuration.
pub mod config;

/// Greeter wire protocol and process channel.
pub mod greeter;

/// Daemon notification relay (FIFO out, notify pipe in) and the
/// indirect-query ledger.
pub mod relay;

/// The per-display orchestrator state machine.
pub mod slave;

/// Admin-facing error formatting.
pub mod utils;
