//! Utility helpers shared by the binary.

pub mod errors;

pub use errors::format_admin_error;

use tracing::info;

/// Log a short startup diagnostic block.
pub fn log_startup_diagnostics() {
    info!("  uid: {} euid: {}", nix::unistd::getuid(), nix::unistd::geteuid());
    info!("  pid: {}", std::process::id());
    info!("  started: {}", chrono::Local::now().to_rfc3339());
}
