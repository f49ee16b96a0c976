pub mod container;
pub mod doctor;
pub mod image;
pub mod mount;
pub mod seatbelt;
pub mod setup;
pub mod snapshot;
pub mod state;
pub mod theme;
pub mod vm;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use crate::backend::BackendManager;
use crate::config::{Dirs, Settings};
use crate::incus::IncusClient;
use crate::platform::Platform;
use crate::sandbox::{HostAccess, SandboxManager};
use crate::state::StateTracker;
use crate::theme as ui_theme;

/// Incus socket of a native Linux install.
pub const NATIVE_SOCKET: &str = "/var/lib/incus/unix.socket";

/// Process-wide context shared by all command handlers.
pub struct App {
    pub dirs: Dirs,
    pub settings: Settings,
    pub platform: Platform,
}

impl App {
    pub fn load() -> Result<Self> {
        let dirs = Dirs::resolve().context("Failed to resolve coop directories")?;
        let settings = Settings::load(&dirs).context("Failed to load settings")?;
        ui_theme::init(settings.theme.as_deref());
        Ok(Self {
            dirs,
            settings,
            platform: Platform::detect(),
        })
    }

    /// Containers live behind a VM backend on non-Linux hosts, or anywhere
    /// a backend is forced.
    pub fn uses_vm(&self) -> bool {
        self.settings.incus_socket.is_none()
            && (self.platform.requires_vm() || self.settings.vm.backend.is_some())
    }

    pub fn backends(&self) -> Result<BackendManager> {
        Ok(BackendManager::from_settings(
            &self.settings,
            &self.dirs,
            self.platform,
        )?)
    }

    pub fn native_socket(&self) -> PathBuf {
        self.settings
            .incus_socket
            .clone()
            .unwrap_or_else(|| PathBuf::from(NATIVE_SOCKET))
    }

    /// Connect to Incus, starting the VM first when needed.
    pub fn connect(&self) -> Result<(IncusClient, HostAccess)> {
        if !self.uses_vm() {
            let socket = self.native_socket();
            debug!(socket = %socket.display(), "app:native incus");
            return Ok((IncusClient::unix(socket), HostAccess::default()));
        }
        let manager = self.backends()?;
        manager.ensure_running(true)?;
        let backend = manager.selected();
        let endpoint = backend.incus_endpoint()?;
        let remote = backend.remote_registration().map(|r| r.remote_name);
        let client = IncusClient::connect(&endpoint, &backend.tls_material(), remote)
            .with_context(|| format!("Failed to connect to Incus at {}", endpoint))?;
        let access = HostAccess {
            ssh_proxy_args: backend.ssh_proxy_args(),
            use_incus_exec: backend.use_incus_exec(),
        };
        debug!(backend = backend.name(), endpoint = %endpoint, "app:connected");
        Ok((client, access))
    }

    pub fn sandbox(&self) -> Result<SandboxManager> {
        let (client, access) = self.connect()?;
        Ok(SandboxManager::new(
            client,
            self.settings.clone(),
            &self.dirs,
            access,
        )?)
    }

    pub fn tracker(&self, name: &str) -> Result<StateTracker> {
        crate::names::validate_container_name(name)?;
        Ok(StateTracker::open(&self.dirs.instances_dir(), name)?)
    }
}
