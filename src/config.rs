//! Resolved configuration: directory layout and user settings.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::fsutil;

pub const DEFAULT_IMAGE: &str = "coop-agent-base";
pub const FALLBACK_IMAGE: &str = "ubuntu/22.04/cloud";
pub const DEFAULT_VM_INSTANCE: &str = "coop";

/// Directory roots, after `COOP_*_DIR` and XDG resolution.
#[derive(Debug, Clone)]
pub struct Dirs {
    pub config: PathBuf,
    pub data: PathBuf,
    pub cache: PathBuf,
}

impl Dirs {
    pub fn resolve() -> Result<Self> {
        let home = home::home_dir();
        let pick = |override_var: &str, xdg_var: &str, fallback: &[&str]| -> Result<PathBuf> {
            if let Some(dir) = non_empty_env(override_var) {
                return Ok(PathBuf::from(dir));
            }
            if let Some(dir) = non_empty_env(xdg_var) {
                return Ok(PathBuf::from(dir).join("coop"));
            }
            let home = home
                .clone()
                .ok_or_else(|| Error::not_found("directory", "home"))?;
            Ok(fallback.iter().fold(home, |p, c| p.join(c)).join("coop"))
        };

        Ok(Self {
            config: pick("COOP_CONFIG_DIR", "XDG_CONFIG_HOME", &[".config"])?,
            data: pick("COOP_DATA_DIR", "XDG_DATA_HOME", &[".local", "share"])?,
            cache: pick("COOP_CACHE_DIR", "XDG_CACHE_HOME", &[".cache"])?,
        })
    }

    /// Layout rooted at a single directory (tests, `--root` style overrides).
    pub fn rooted(root: &Path) -> Self {
        Self {
            config: root.join("config"),
            data: root.join("data"),
            cache: root.join("cache"),
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config.join("settings.json")
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.config.join("ssh")
    }

    pub fn seatbelt_key_path(&self) -> PathBuf {
        self.config.join("seatbelt.key")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.data.join("instances")
    }

    pub fn image_registry_path(&self) -> PathBuf {
        self.data.join("images.json")
    }

    /// Create every directory coop writes into.
    pub fn ensure(&self) -> Result<()> {
        fsutil::create_private_dir(&self.config)?;
        fsutil::create_private_dir(&self.ssh_dir())?;
        fsutil::create_private_dir(&self.data)?;
        fsutil::create_private_dir(&self.instances_dir())?;
        for sub in ["images", "disks", "profiles", "logs"] {
            fs::create_dir_all(self.data.join(sub))?;
        }
        fs::create_dir_all(&self.cache)?;
        Ok(())
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Default resources for new containers.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct ContainerDefaults {
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub disk_gb: Option<u64>,
    /// Storage pool backing the root disk. Default: "default"
    #[serde(default)]
    pub storage_pool: Option<String>,
}

impl ContainerDefaults {
    pub fn cpus(&self) -> u32 {
        self.cpus.unwrap_or(2)
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb.unwrap_or(4096)
    }

    pub fn disk_gb(&self) -> u64 {
        self.disk_gb.unwrap_or(20)
    }

    pub fn storage_pool(&self) -> &str {
        self.storage_pool.as_deref().unwrap_or("default")
    }
}

/// HTTPS Incus endpoint for the `remote` backend.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct RemoteSettings {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    #[serde(default)]
    pub server_cert: Option<PathBuf>,
}

/// VM backend selection and sizing.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct VmSettings {
    /// Force a single backend by name.
    #[serde(default)]
    pub backend: Option<String>,
    /// Preferred backend order. Default depends on the host platform.
    #[serde(default)]
    pub priority: Option<Vec<String>>,
    /// VM instance / profile name. Default: "coop"
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory_gib: Option<u32>,
    #[serde(default)]
    pub disk_gib: Option<u32>,
    /// Guest architecture (`aarch64` or `x86_64`). Default: host architecture
    #[serde(default)]
    pub arch: Option<String>,
    /// `vz` or `qemu`. Default: backend decides
    #[serde(default)]
    pub vm_type: Option<String>,
    #[serde(default)]
    pub rosetta: Option<bool>,
    #[serde(default)]
    pub nested_virtualization: Option<bool>,
    #[serde(default)]
    pub dns: Option<Vec<String>>,
    /// Start the VM on demand. Default: true
    #[serde(default)]
    pub auto_start: Option<bool>,
    #[serde(default)]
    pub remote: RemoteSettings,
}

impl VmSettings {
    pub fn instance(&self) -> &str {
        self.instance.as_deref().unwrap_or(DEFAULT_VM_INSTANCE)
    }

    pub fn cpus(&self) -> u32 {
        self.cpus.unwrap_or(4)
    }

    pub fn memory_gib(&self) -> u32 {
        self.memory_gib.unwrap_or(8)
    }

    pub fn disk_gib(&self) -> u32 {
        self.disk_gib.unwrap_or(100)
    }

    pub fn arch(&self) -> &str {
        self.arch
            .as_deref()
            .unwrap_or_else(|| crate::platform::host_arch())
    }

    pub fn rosetta(&self) -> bool {
        self.rosetta.unwrap_or(false)
    }

    pub fn nested_virtualization(&self) -> bool {
        self.nested_virtualization.unwrap_or(false)
    }

    pub fn dns(&self) -> &[String] {
        self.dns.as_deref().unwrap_or(&[])
    }

    pub fn auto_start(&self) -> bool {
        self.auto_start.unwrap_or(true)
    }
}

/// User settings persisted in `<config>/settings.json`.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Settings {
    /// Local image alias used for new containers. Default: "coop-agent-base"
    #[serde(default)]
    pub default_image: Option<String>,
    /// Remote image used when the default alias is missing. Default: "ubuntu/22.04/cloud"
    #[serde(default)]
    pub fallback_image: Option<String>,
    /// Pin the fallback image to a fingerprint on the remote server.
    #[serde(default)]
    pub fallback_fingerprint: Option<String>,
    /// Incus unix socket for native Linux hosts.
    #[serde(default)]
    pub incus_socket: Option<PathBuf>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub container: ContainerDefaults,
    #[serde(default)]
    pub vm: VmSettings,
}

impl Settings {
    pub fn default_image(&self) -> &str {
        self.default_image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    pub fn fallback_image(&self) -> &str {
        self.fallback_image.as_deref().unwrap_or(FALLBACK_IMAGE)
    }

    /// Load settings from disk (missing file means defaults), then apply
    /// environment overrides.
    pub fn load(dirs: &Dirs) -> Result<Self> {
        let path = dirs.settings_path();
        let mut settings = Self::load_from_path(&path)?.unwrap_or_default();
        settings.apply_env(|var| non_empty_env(var));
        debug!(path = %path.display(), backend = ?settings.vm.backend, "config:loaded");
        Ok(settings)
    }

    fn load_from_path(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)
            .map_err(|e| Error::from(e).context(format!("parse {}", path.display())))?;
        Ok(Some(settings))
    }

    pub fn save(&self, dirs: &Dirs) -> Result<()> {
        fsutil::create_private_dir(&dirs.config)?;
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        fsutil::write_private(&dirs.settings_path(), json.as_bytes())
    }

    /// Apply `COOP_*` overrides. `lookup` abstracts `std::env::var`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("COOP_DEFAULT_IMAGE") {
            self.default_image = Some(v);
        }
        if let Some(v) = lookup("COOP_FALLBACK_IMAGE") {
            self.fallback_image = Some(v);
        }
        if let Some(v) = lookup("COOP_FALLBACK_FINGERPRINT") {
            self.fallback_fingerprint = Some(v);
        }
        if let Some(v) = lookup("COOP_INCUS_SOCKET") {
            self.incus_socket = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("COOP_VM_BACKEND") {
            self.vm.backend = Some(v);
        }
        // Legacy variable; the explicit instance override wins.
        if let Some(v) = lookup("COOP_LIMA_INSTANCE") {
            self.vm.instance = Some(v);
        }
        if let Some(v) = lookup("COOP_VM_INSTANCE") {
            self.vm.instance = Some(v);
        }
        if let Some(v) = lookup("COOP_THEME") {
            self.theme = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.default_image(), "coop-agent-base");
        assert_eq!(s.fallback_image(), "ubuntu/22.04/cloud");
        assert_eq!(s.container.cpus(), 2);
        assert_eq!(s.container.memory_mb(), 4096);
        assert_eq!(s.container.disk_gb(), 20);
        assert_eq!(s.vm.instance(), "coop");
        assert!(s.vm.auto_start());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("COOP_DEFAULT_IMAGE", "my-base"),
            ("COOP_VM_BACKEND", "lima"),
            ("COOP_LIMA_INSTANCE", "legacy"),
            ("COOP_VM_INSTANCE", "explicit"),
        ]
        .into_iter()
        .collect();
        let mut s = Settings::default();
        s.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.default_image(), "my-base");
        assert_eq!(s.vm.backend.as_deref(), Some("lima"));
        assert_eq!(s.vm.instance(), "explicit");
    }

    #[test]
    fn legacy_lima_instance_alone() {
        let mut s = Settings::default();
        s.apply_env(|k| (k == "COOP_LIMA_INSTANCE").then(|| "old-vm".to_string()));
        assert_eq!(s.vm.instance(), "old-vm");
    }

    #[test]
    fn save_and_load_round_trip_with_private_mode() {
        let dir = TempDir::new().unwrap();
        let dirs = Dirs::rooted(dir.path());
        let mut s = Settings::default();
        s.container.cpus = Some(6);
        s.vm.priority = Some(vec!["lima".into()]);
        s.save(&dirs).unwrap();

        let loaded = Settings::load_from_path(&dirs.settings_path())
            .unwrap()
            .unwrap();
        assert_eq!(loaded, s);
        assert_eq!(fsutil::mode_of(&dirs.settings_path()).unwrap(), 0o600);
    }

    #[test]
    fn ensure_creates_layout() {
        let dir = TempDir::new().unwrap();
        let dirs = Dirs::rooted(dir.path());
        dirs.ensure().unwrap();
        assert!(dirs.instances_dir().is_dir());
        assert!(dirs.data.join("profiles").is_dir());
        assert_eq!(fsutil::mode_of(&dirs.ssh_dir()).unwrap(), 0o700);
    }
}
