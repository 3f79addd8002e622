//! Process and signal primitives
//!
//! Foundation helpers shared by the rest of the slave: reference-counted
//! signal blocking, async-signal-safe delivery flags, line-oriented fd I/O
//! and MIT-MAGIC-COOKIE generation.

pub mod cookie;
pub mod fdio;
pub mod signals;
