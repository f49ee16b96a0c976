//! Backend selection and the ensure-running flow.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::bladerunner::BladerunnerBackend;
use super::colima::ColimaBackend;
use super::lima::LimaBackend;
use super::remote::RemoteBackend;
use super::{Backend, RemoteRegistration, VmSpec, VmState, VmStatus};
use crate::cmd::Cmd;
use crate::config::{Dirs, Settings};
use crate::error::{Error, Result};
use crate::platform::{HostOs, Platform};
use crate::prompt::{self, Dialog};

/// Names of every backend this build knows about.
pub const KNOWN_BACKENDS: &[&str] = &["bladerunner", "colima", "lima", "remote"];

/// Default priority when settings do not specify one.
pub fn default_priority(platform: &Platform) -> Vec<String> {
    let order: &[&str] = match platform.os {
        HostOs::MacOs => &["bladerunner", "colima", "lima", "remote"],
        _ => &["lima", "colima", "remote", "bladerunner"],
    };
    order.iter().map(|s| s.to_string()).collect()
}

pub struct BackendManager {
    backends: Vec<Box<dyn Backend>>,
    priority: Vec<String>,
    auto_start: bool,
    selected: usize,
}

impl std::fmt::Debug for BackendManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendManager")
            .field("selected", &self.selected().name())
            .field("priority", &self.priority)
            .finish()
    }
}

impl BackendManager {
    /// Register all backends from settings and select one.
    pub fn from_settings(settings: &Settings, dirs: &Dirs, platform: Platform) -> Result<Self> {
        let spec = VmSpec::from_settings(&settings.vm)?;
        let mut backends: Vec<Box<dyn Backend>> = vec![
            Box::new(BladerunnerBackend::new(spec.clone(), platform)),
            Box::new(ColimaBackend::new(spec.clone(), platform)),
            Box::new(LimaBackend::new(spec, platform, dirs.cache.clone())),
            Box::new(RemoteBackend::new(settings.vm.remote.clone())),
        ];
        let priority = match (&settings.vm.backend, &settings.vm.priority) {
            (Some(forced), _) => {
                if !KNOWN_BACKENDS.contains(&forced.as_str()) {
                    return Err(Error::NoBackendAvailable(format!(
                        "unknown backend '{}' (known: {})",
                        forced,
                        KNOWN_BACKENDS.join(", ")
                    )));
                }
                backends.retain(|b| b.name() == forced);
                vec![forced.clone()]
            }
            (None, Some(priority)) if !priority.is_empty() => priority.clone(),
            _ => default_priority(&platform),
        };
        Self::new(backends, priority, settings.vm.auto_start())
    }

    /// Select the first available backend named in `priority`, else the
    /// first available overall.
    pub fn new(
        backends: Vec<Box<dyn Backend>>,
        priority: Vec<String>,
        auto_start: bool,
    ) -> Result<Self> {
        let by_priority = priority.iter().find_map(|name| {
            backends
                .iter()
                .position(|b| b.name() == name && b.available())
        });
        let selected = by_priority
            .or_else(|| backends.iter().position(|b| b.available()))
            .ok_or_else(|| {
                let names: Vec<_> = backends.iter().map(|b| b.name()).collect();
                Error::NoBackendAvailable(format!(
                    "none of [{}] is installed",
                    names.join(", ")
                ))
            })?;
        debug!(backend = backends[selected].name(), "backend:selected");
        Ok(Self {
            backends,
            priority,
            auto_start,
            selected,
        })
    }

    pub fn selected(&self) -> &dyn Backend {
        self.backends[self.selected].as_ref()
    }

    /// (name, available, selected) for every registered backend.
    pub fn summary(&self) -> Vec<(&'static str, bool, bool)> {
        self.backends
            .iter()
            .enumerate()
            .map(|(i, b)| (b.name(), b.available(), i == self.selected))
            .collect()
    }

    pub fn priority(&self) -> &[String] {
        &self.priority
    }

    /// Make sure the selected backend's VM is running, prompting first when
    /// `interactive` and a terminal is attached.
    pub fn ensure_running(&self, interactive: bool) -> Result<()> {
        self.ensure_running_with(interactive && prompt::is_interactive(), |status| {
            Dialog {
                title: "VM not running",
                lines: vec![
                    format!("Backend: {}", self.selected().name()),
                    format!("Instance: {} ({})", status.name, status.state),
                ],
                question: "Start it now?",
                default_yes: true,
            }
            .confirm()
        })
    }

    /// `ensure_running` with the confirmation dialog injected.
    pub fn ensure_running_with(
        &self,
        interactive: bool,
        confirm: impl FnOnce(&VmStatus) -> Result<bool>,
    ) -> Result<()> {
        let backend = self.selected();
        let status = backend.status()?;
        if status.state == VmState::Running {
            self.register_remote();
            return Ok(());
        }
        if !self.auto_start {
            return Err(Error::UserCancel(format!(
                "VM '{}' is {} and auto-start is disabled. Run `coop vm start` first.",
                status.name, status.state
            )));
        }
        if interactive && !confirm(&status)? {
            return Err(Error::UserCancel(format!(
                "VM '{}' was not started.",
                status.name
            )));
        }
        info!(backend = backend.name(), instance = %status.name, "backend:auto-start");
        backend.start()?;
        self.register_remote();
        Ok(())
    }

    /// Register HTTPS backends as the `incus` CLI default remote. Failures
    /// are logged and otherwise ignored.
    pub fn register_remote(&self) {
        let Some(registration) = self.selected().remote_registration() else {
            return;
        };
        if let Err(e) = register_incus_remote(&registration) {
            warn!(remote = %registration.remote_name, error = %e, "backend:remote registration failed");
        }
    }
}

/// Incus CLI configuration directory.
pub fn incus_config_dir() -> Option<PathBuf> {
    incus_config_dir_from(|var| std::env::var(var).ok())
}

fn incus_config_dir_from(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let non_empty = |var| lookup(var).filter(|v| !v.is_empty());
    if let Some(dir) = non_empty("INCUS_CONF") {
        return Some(PathBuf::from(dir));
    }
    if let Some(dir) = non_empty("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(dir).join("incus"));
    }
    home::home_dir().map(|h| h.join(".config").join("incus"))
}

/// Copy the client certificate and key into the Incus CLI config dir unless
/// it already has its own. The pinned server cert goes to `servercerts/`.
pub fn install_client_cert(conf_dir: &Path, registration: &RemoteRegistration) -> Result<()> {
    crate::fsutil::create_private_dir(conf_dir)?;
    let tls = &registration.tls;
    for (src, name) in [(&tls.client_cert, "client.crt"), (&tls.client_key, "client.key")] {
        let dest = conf_dir.join(name);
        if src.is_empty() || dest.exists() {
            continue;
        }
        let contents = std::fs::read(src)?;
        crate::fsutil::write_private(&dest, &contents)?;
        debug!(dest = %dest.display(), "backend:installed incus client credential");
    }
    if !tls.server_cert.is_empty() && Path::new(&tls.server_cert).is_file() {
        let dir = conf_dir.join("servercerts");
        crate::fsutil::create_private_dir(&dir)?;
        let contents = std::fs::read(&tls.server_cert)?;
        crate::fsutil::write_private(
            &dir.join(format!("{}.crt", registration.remote_name)),
            &contents,
        )?;
    }
    Ok(())
}

fn register_incus_remote(registration: &RemoteRegistration) -> Result<()> {
    which::which("incus").map_err(|_| Error::not_found("binary", "incus"))?;
    let conf_dir =
        incus_config_dir().ok_or_else(|| Error::not_found("incus config dir", "~/.config/incus"))?;
    install_client_cert(&conf_dir, registration)?;

    let listing = Cmd::new("incus")
        .args(["remote", "list", "--format", "json"])
        .run_and_capture_stdout()?;
    let remotes: BTreeMap<String, serde_json::Value> = serde_json::from_str(&listing)?;
    if !remotes.contains_key(&registration.remote_name) {
        Cmd::new("incus")
            .args(["remote", "add", &registration.remote_name, &registration.url])
            .arg("--accept-certificate")
            .run()?;
        info!(remote = %registration.remote_name, url = %registration.url, "backend:remote added");
    }
    Cmd::new("incus")
        .args(["remote", "switch", &registration.remote_name])
        .run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{IncusEndpoint, TlsMaterial};
    use crate::error::ErrorKind;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct FakeBackend {
        name: &'static str,
        installed: bool,
        state: Mutex<VmState>,
        started: AtomicBool,
    }

    impl FakeBackend {
        fn boxed(name: &'static str, installed: bool, state: VmState) -> Box<dyn Backend> {
            Box::new(Self {
                name,
                installed,
                state: Mutex::new(state),
                started: AtomicBool::new(false),
            })
        }
    }

    impl Backend for FakeBackend {
        fn name(&self) -> &'static str {
            self.name
        }
        fn available(&self) -> bool {
            self.installed
        }
        fn status(&self) -> Result<VmStatus> {
            Ok(VmStatus::with_state("coop", *self.state.lock().unwrap()))
        }
        fn start(&self) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            *self.state.lock().unwrap() = VmState::Running;
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn delete(&self) -> Result<()> {
            Err(Error::Unsupported("delete".into()))
        }
        fn shell(&self) -> Result<i32> {
            Ok(0)
        }
        fn exec(&self, _argv: &[&str]) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn incus_endpoint(&self) -> Result<IncusEndpoint> {
            Ok(IncusEndpoint::Unix("/tmp/incus.sock".into()))
        }
    }

    fn priority(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn selects_first_available_in_priority() {
        let mgr = BackendManager::new(
            vec![
                FakeBackend::boxed("bladerunner", false, VmState::Missing),
                FakeBackend::boxed("colima", false, VmState::Missing),
                FakeBackend::boxed("lima", true, VmState::Stopped),
            ],
            priority(&["bladerunner", "colima", "lima"]),
            true,
        )
        .unwrap();
        assert_eq!(mgr.selected().name(), "lima");
    }

    #[test]
    fn falls_back_to_first_available_outside_priority() {
        let mgr = BackendManager::new(
            vec![
                FakeBackend::boxed("colima", true, VmState::Running),
                FakeBackend::boxed("lima", false, VmState::Missing),
            ],
            priority(&["lima"]),
            true,
        )
        .unwrap();
        assert_eq!(mgr.selected().name(), "colima");
    }

    #[test]
    fn nothing_installed() {
        let err = BackendManager::new(
            vec![FakeBackend::boxed("lima", false, VmState::Missing)],
            priority(&["lima"]),
            true,
        )
        .unwrap_err();
        assert!(err.is(ErrorKind::NoBackendAvailable));
    }

    #[test]
    fn non_interactive_auto_start() {
        let mgr = BackendManager::new(
            vec![FakeBackend::boxed("lima", true, VmState::Stopped)],
            priority(&["lima"]),
            true,
        )
        .unwrap();
        mgr.ensure_running_with(false, |_| panic!("must not prompt"))
            .unwrap();
        assert_eq!(mgr.selected().status().unwrap().state, VmState::Running);
    }

    #[test]
    fn auto_start_disabled_is_user_cancel() {
        let mgr = BackendManager::new(
            vec![FakeBackend::boxed("lima", true, VmState::Stopped)],
            priority(&["lima"]),
            false,
        )
        .unwrap();
        let err = mgr.ensure_running_with(true, |_| Ok(true)).unwrap_err();
        assert!(err.is(ErrorKind::UserCancel));
        assert!(err.to_string().contains("auto-start is disabled"));
    }

    #[test]
    fn declined_prompt_is_user_cancel() {
        let mgr = BackendManager::new(
            vec![FakeBackend::boxed("lima", true, VmState::Missing)],
            priority(&["lima"]),
            true,
        )
        .unwrap();
        let err = mgr.ensure_running_with(true, |_| Ok(false)).unwrap_err();
        assert!(err.is(ErrorKind::UserCancel));
        assert_eq!(mgr.selected().status().unwrap().state, VmState::Missing);
    }

    #[test]
    fn running_vm_needs_no_prompt() {
        let mgr = BackendManager::new(
            vec![FakeBackend::boxed("lima", true, VmState::Running)],
            priority(&["lima"]),
            false,
        )
        .unwrap();
        mgr.ensure_running_with(true, |_| panic!("must not prompt"))
            .unwrap();
    }

    #[test]
    fn default_priority_prefers_bladerunner_on_macos() {
        let mac = Platform {
            os: HostOs::MacOs,
            arch: "aarch64",
        };
        assert_eq!(default_priority(&mac)[0], "bladerunner");
    }

    #[test]
    fn incus_conf_dir_resolution() {
        let dir = incus_config_dir_from(|v| (v == "INCUS_CONF").then(|| "/etc/inc".into()));
        assert_eq!(dir.unwrap(), PathBuf::from("/etc/inc"));
        let dir = incus_config_dir_from(|v| (v == "XDG_CONFIG_HOME").then(|| "/x".into()));
        assert_eq!(dir.unwrap(), PathBuf::from("/x/incus"));
    }

    #[test]
    fn client_cert_is_copied_once() {
        let src = TempDir::new().unwrap();
        let conf = TempDir::new().unwrap();
        let cert = src.path().join("client.crt");
        let key = src.path().join("client.key");
        let server = src.path().join("server.crt");
        std::fs::write(&cert, "CERT").unwrap();
        std::fs::write(&key, "KEY").unwrap();
        std::fs::write(&server, "SERVER").unwrap();
        let reg = RemoteRegistration {
            remote_name: "coop-coop".into(),
            url: "https://127.0.0.1:18443".into(),
            tls: TlsMaterial {
                client_cert: cert.to_string_lossy().into(),
                client_key: key.to_string_lossy().into(),
                server_cert: server.to_string_lossy().into(),
            },
        };
        let dest = conf.path().join("incus");
        install_client_cert(&dest, &reg).unwrap();
        assert_eq!(std::fs::read_to_string(dest.join("client.crt")).unwrap(), "CERT");
        assert_eq!(
            std::fs::read_to_string(dest.join("servercerts/coop-coop.crt")).unwrap(),
            "SERVER"
        );

        std::fs::write(&cert, "NEW").unwrap();
        install_client_cert(&dest, &reg).unwrap();
        assert_eq!(std::fs::read_to_string(dest.join("client.crt")).unwrap(), "CERT");
    }
}
