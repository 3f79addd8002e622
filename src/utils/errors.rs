//! Admin-facing error formatting
//!
//! Fatal startup errors end up in the daemon log, read by an
//! administrator under pressure. This turns a technical error chain into
//! a short triage message with the likely causes for the failure class.

use std::fmt::Write;

/// Format a fatal error with troubleshooting hints.
pub fn format_admin_error(error: &anyhow::Error) -> String {
    let mut output = String::new();

    writeln!(&mut output).ok();
    writeln!(&mut output, "==== luxdm-slave failed ====").ok();
    writeln!(&mut output).ok();

    let error_msg = error.to_string();

    if error_msg.contains("pam") || error_msg.contains("PAM") || error_msg.contains("auth backend") {
        format_auth_error(&mut output);
    } else if error_msg.contains("fifo") || error_msg.contains("notify") {
        format_relay_error(&mut output);
    } else if error_msg.contains("X server") {
        format_server_error(&mut output);
    } else if error_msg.contains("config") || error_msg.contains("Config") {
        format_config_error(&mut output);
    } else {
        writeln!(&mut output, "The display slave hit an unexpected error.").ok();
    }

    writeln!(&mut output).ok();
    writeln!(&mut output, "Technical details:").ok();
    writeln!(&mut output, "{error:#}").ok();
    output
}

fn format_auth_error(output: &mut String) {
    writeln!(output, "Authentication backend problem.").ok();
    writeln!(output).ok();
    writeln!(output, "Common causes:").ok();
    writeln!(output, "  1. Missing PAM service file under /etc/pam.d/ (luxdm, luxdm-autologin)").ok();
    writeln!(output, "  2. Built without the pam-auth feature but configured for pam").ok();
    writeln!(output, "     -> set auth.backend = \"crypt\" or rebuild with pam-auth").ok();
}

fn format_relay_error(output: &mut String) {
    writeln!(output, "Daemon relay problem.").ok();
    writeln!(output).ok();
    writeln!(output, "Common causes:").ok();
    writeln!(output, "  1. The parent daemon is not running or crashed").ok();
    writeln!(output, "  2. Wrong fifo_path / notify_dir in the [daemon] config section").ok();
    writeln!(output, "  3. Permissions on the runtime directory (must be root-owned)").ok();
}

fn format_server_error(output: &mut String) {
    writeln!(output, "X server problem.").ok();
    writeln!(output).ok();
    writeln!(output, "Common causes:").ok();
    writeln!(output, "  1. Wrong server command in the [server] config section").ok();
    writeln!(output, "  2. The X binary is missing or not executable").ok();
    writeln!(output, "  3. Another server already owns this display or VT").ok();
}

fn format_config_error(output: &mut String) {
    writeln!(output, "Configuration problem.").ok();
    writeln!(output).ok();
    writeln!(output, "Common causes:").ok();
    writeln!(output, "  1. Syntax error in the TOML file").ok();
    writeln!(output, "  2. Invalid section values (run with -v for the full parse error)").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_get_pam_hints() {
        let err = anyhow::anyhow!("auth backend 'pam' unavailable");
        let text = format_admin_error(&err);
        assert!(text.contains("pam.d"));
        assert!(text.contains("Technical details"));
    }

    #[test]
    fn unknown_errors_still_carry_details() {
        let err = anyhow::anyhow!("something odd");
        let text = format_admin_error(&err);
        assert!(text.contains("something odd"));
    }
}
