//! Host platform detection.

use std::fmt;

/// Kernel marker that identifies a WSL2 guest.
const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    MacOs,
    Linux,
    Wsl2,
    Other,
}

impl fmt::Display for HostOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostOs::MacOs => "macos",
            HostOs::Linux => "linux",
            HostOs::Wsl2 => "wsl2",
            HostOs::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: HostOs,
    pub arch: &'static str,
}

impl Platform {
    /// Detect the running host.
    pub fn detect() -> Self {
        let os = if cfg!(target_os = "macos") {
            HostOs::MacOs
        } else if cfg!(target_os = "linux") {
            let release = std::fs::read_to_string(OSRELEASE_PATH).unwrap_or_default();
            classify_linux(&release)
        } else {
            HostOs::Other
        };
        Self {
            os,
            arch: host_arch(),
        }
    }

    /// Whether Incus has to run inside a VM on this host.
    pub fn requires_vm(&self) -> bool {
        matches!(self.os, HostOs::MacOs | HostOs::Other)
    }

    pub fn is_apple_silicon(&self) -> bool {
        self.os == HostOs::MacOs && self.arch == "aarch64"
    }
}

fn classify_linux(osrelease: &str) -> HostOs {
    let lower = osrelease.to_lowercase();
    if lower.contains("microsoft") || lower.contains("wsl") {
        HostOs::Wsl2
    } else {
        HostOs::Linux
    }
}

/// Normalized architecture name (`x86_64` or `aarch64`).
pub fn host_arch() -> &'static str {
    normalize_arch(std::env::consts::ARCH)
}

pub fn normalize_arch(arch: &str) -> &'static str {
    match arch {
        "aarch64" | "arm64" => "aarch64",
        "x86_64" | "amd64" => "x86_64",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wsl_marker_detected() {
        assert_eq!(
            classify_linux("5.15.153.1-microsoft-standard-WSL2\n"),
            HostOs::Wsl2
        );
        assert_eq!(classify_linux("6.8.0-45-generic\n"), HostOs::Linux);
    }

    #[test]
    fn arch_aliases_normalize() {
        assert_eq!(normalize_arch("arm64"), "aarch64");
        assert_eq!(normalize_arch("amd64"), "x86_64");
        assert_eq!(normalize_arch("riscv64"), "unknown");
    }

    #[test]
    fn requires_vm_only_off_linux() {
        let mac = Platform {
            os: HostOs::MacOs,
            arch: "aarch64",
        };
        let linux = Platform {
            os: HostOs::Linux,
            arch: "x86_64",
        };
        assert!(mac.requires_vm());
        assert!(mac.is_apple_silicon());
        assert!(!linux.requires_vm());
    }
}
