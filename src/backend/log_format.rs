//! Reformat logrus-style lines printed by `limactl` and `colima`.

use regex::Regex;
use std::sync::LazyLock;

/// time="..." level=... msg="..."
static LOGRUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^time="[^"]*"\s+level=(\w+)\s+msg="((?:[^"\\]|\\.)*)""#).expect("static regex")
});

/// Info-level chatter hidden from the terminal. Warnings are always shown.
const NOISE: &[&str] = &[
    "Terminal is not available",
    "Not forwarding TCP",
    "[hostagent] Waiting for",
    "provisioning ...",
];

/// `None` hides the line; non-logrus lines pass through unchanged.
pub fn format_tool_log_line(line: &str) -> Option<String> {
    let Some(caps) = LOGRUS_RE.captures(line) else {
        return Some(line.to_string());
    };

    let level = &caps[1];
    let msg = caps[2].replace("\\\"", "\"");

    let quiet_level = matches!(level, "info" | "debug" | "trace");
    if quiet_level && NOISE.iter().any(|p| msg.contains(p)) {
        return None;
    }

    let tag = match level {
        "warning" | "warn" => "[WARN] ",
        "error" | "fatal" => "[ERROR] ",
        _ => "",
    };
    Some(format!("  {}{}", tag, msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_line_is_unwrapped() {
        let line = r#"time="2026-02-06T07:30:37+02:00" level=info msg="Starting the instance \"coop\" with VM driver \"vz\"""#;
        assert_eq!(
            format_tool_log_line(line).unwrap(),
            r#"  Starting the instance "coop" with VM driver "vz""#
        );
    }

    #[test]
    fn noise_is_hidden_but_warnings_kept() {
        let noise = r#"time="x" level=info msg="Not forwarding TCP 0.0.0.0:22""#;
        assert_eq!(format_tool_log_line(noise), None);
        let warn = r#"time="x" level=warning msg="Not forwarding TCP 0.0.0.0:22""#;
        assert_eq!(
            format_tool_log_line(warn).unwrap(),
            "  [WARN] Not forwarding TCP 0.0.0.0:22"
        );
    }

    #[test]
    fn plain_lines_pass_through() {
        assert_eq!(
            format_tool_log_line("INFO[0000] starting colima").unwrap(),
            "INFO[0000] starting colima"
        );
    }

    #[test]
    fn fatal_is_error() {
        let line = r#"time="x" level=fatal msg="error starting vm""#;
        assert_eq!(
            format_tool_log_line(line).unwrap(),
            "  [ERROR] error starting vm"
        );
    }
}
