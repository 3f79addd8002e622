//! Greeter wire protocol and process channel
//!
//! The greeter is an unprivileged UI process. The slave talks to it over a
//! pipe pair with a synchronous, half-duplex request/reply protocol:
//! single-byte opcodes out, STX-framed text back, BEL-prefixed replies for
//! out-of-band interruptions.

pub mod channel;
pub mod protocol;

pub use channel::{GreeterChannel, InterruptFlags};
pub use protocol::{Interrupt, Opcode, Reply};
