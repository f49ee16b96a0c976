//! VM backends that host the Incus daemon.
//!
//! Each backend wraps one external VM tool (bladerunner, colima, lima) or a
//! pre-provisioned HTTPS endpoint (remote) behind the [`Backend`] trait. The
//! [`BackendManager`] picks one at construction time.

pub mod bladerunner;
pub mod colima;
pub mod control;
pub mod lima;
mod log_format;
pub mod manager;
pub mod remote;

use std::fmt;
use std::path::PathBuf;

use crate::config::VmSettings;
use crate::error::{Error, Result};
use crate::platform::Platform;

pub use manager::BackendManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    Stopped,
    /// The VM has never been created (or was deleted).
    Missing,
    Unknown,
}

impl VmState {
    /// Map a tool-reported status string.
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "running" => VmState::Running,
            "stopped" | "stopping" | "broken" => VmState::Stopped,
            "missing" | "" => VmState::Missing,
            _ => VmState::Unknown,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Backend-reported VM record.
#[derive(Debug, Clone, PartialEq)]
pub struct VmStatus {
    pub name: String,
    pub state: VmState,
    pub cpus: u32,
    pub memory_gib: f64,
    pub disk_gib: f64,
    pub arch: String,
    pub runtime: String,
}

impl VmStatus {
    pub fn missing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: VmState::Missing,
            cpus: 0,
            memory_gib: 0.0,
            disk_gib: 0.0,
            arch: String::new(),
            runtime: String::new(),
        }
    }

    pub fn with_state(name: &str, state: VmState) -> Self {
        Self {
            state,
            ..Self::missing(name)
        }
    }
}

/// Where the Incus API is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncusEndpoint {
    Unix(PathBuf),
    Https(String),
}

impl fmt::Display for IncusEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncusEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            IncusEndpoint::Https(url) => f.write_str(url),
        }
    }
}

/// Client certificate, key and pinned server certificate paths.
/// All empty for Unix-socket endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub client_cert: String,
    pub client_key: String,
    pub server_cert: String,
}

impl TlsMaterial {
    pub fn is_empty(&self) -> bool {
        self.client_cert.is_empty() && self.client_key.is_empty() && self.server_cert.is_empty()
    }
}

/// Details needed to add the backend as a named `incus` CLI remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRegistration {
    pub remote_name: String,
    pub url: String,
    pub tls: TlsMaterial,
}

/// Interface every VM backend implements.
pub trait Backend: Send + Sync {
    /// Stable identifier (e.g. "lima").
    fn name(&self) -> &'static str;

    /// Fast, side-effect-free installation check. Must not start anything.
    fn available(&self) -> bool;

    fn status(&self) -> Result<VmStatus>;

    /// Idempotent. Creates the VM when it is missing.
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn delete(&self) -> Result<()>;

    /// Interactive shell in the VM; returns the shell's exit code.
    fn shell(&self) -> Result<i32>;

    /// Run a command in the VM and return its stdout.
    fn exec(&self, argv: &[&str]) -> Result<Vec<u8>>;

    fn incus_endpoint(&self) -> Result<IncusEndpoint>;

    fn tls_material(&self) -> TlsMaterial {
        TlsMaterial::default()
    }

    /// SSH options that tunnel through the VM when container IPs are not
    /// routable from the host. Empty when no tunnel is needed.
    fn ssh_proxy_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Container IPs are unreachable from the host altogether; interactive
    /// shells must go through the Incus exec API.
    fn use_incus_exec(&self) -> bool {
        false
    }

    /// HTTPS backends can be registered as an `incus` CLI remote.
    fn remote_registration(&self) -> Option<RemoteRegistration> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    Vz,
    Qemu,
}

impl VmType {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vz" => Ok(VmType::Vz),
            "qemu" => Ok(VmType::Qemu),
            other => Err(Error::Unsupported(format!("vm type '{}'", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmType::Vz => "vz",
            VmType::Qemu => "qemu",
        }
    }
}

/// Resolved VM creation parameters shared by the tool-driven backends.
#[derive(Debug, Clone, PartialEq)]
pub struct VmSpec {
    pub instance: String,
    pub arch: String,
    pub cpus: u32,
    pub memory_gib: u32,
    pub disk_gib: u32,
    pub dns: Vec<String>,
    pub vm_type: Option<VmType>,
    pub rosetta: bool,
    pub nested_virtualization: bool,
}

impl VmSpec {
    pub fn from_settings(vm: &VmSettings) -> Result<Self> {
        Ok(Self {
            instance: vm.instance().to_string(),
            arch: crate::platform::normalize_arch(vm.arch()).to_string(),
            cpus: vm.cpus(),
            memory_gib: vm.memory_gib(),
            disk_gib: vm.disk_gib(),
            dns: vm.dns().to_vec(),
            vm_type: vm.vm_type.as_deref().map(VmType::parse).transpose()?,
            rosetta: vm.rosetta(),
            nested_virtualization: vm.nested_virtualization(),
        })
    }

    /// Reject combinations the hypervisors cannot run, before invoking any tool.
    pub fn validate(&self, platform: &Platform) -> Result<()> {
        if self.arch == "unknown" {
            return Err(Error::Unsupported("unknown VM architecture".into()));
        }
        let native = self.arch == platform.arch;
        if self.vm_type == Some(VmType::Vz) && !native {
            return Err(Error::Unsupported(format!(
                "vz VMs with non-native architecture {} (host is {})",
                self.arch, platform.arch
            )));
        }
        if self.rosetta {
            if !platform.is_apple_silicon() {
                return Err(Error::Unsupported(
                    "Rosetta outside Apple Silicon hosts".into(),
                ));
            }
            if self.vm_type == Some(VmType::Qemu) || !native {
                return Err(Error::Unsupported(
                    "Rosetta without a native vz VM".into(),
                ));
            }
        }
        if self.vm_type == Some(VmType::Vz) && platform.os != crate::platform::HostOs::MacOs {
            return Err(Error::Unsupported("vz outside macOS".into()));
        }
        Ok(())
    }

    /// Effective VM type: explicit setting, else vz for native macOS guests.
    pub fn effective_vm_type(&self, platform: &Platform) -> VmType {
        self.vm_type.unwrap_or({
            if platform.os == crate::platform::HostOs::MacOs && self.arch == platform.arch {
                VmType::Vz
            } else {
                VmType::Qemu
            }
        })
    }
}

/// Directory for tool state, honoring `XDG_STATE_HOME`.
pub(crate) fn xdg_state_home() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("XDG_STATE_HOME")
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    home::home_dir().map(|h| h.join(".local").join("state"))
}
