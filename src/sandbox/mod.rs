//! Sandbox manager: turns "create agent X with these resources and mounts"
//! into Incus calls, cloud-init bootstrap and state tracking.

pub mod cloudinit;
pub mod readiness;
pub mod ssh;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Dirs, Settings};
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::guard::{AuthCode, Authorizer, MountGuard};
use crate::images::ImageRegistry;
use crate::incus::types::{
    Condition, ContainerStatus, DEFAULT_IMAGE_SERVER, Device, ExecOutput, Image, ImageSource, Instance,
    Snapshot,
};
use crate::incus::IncusClient;
use crate::names;
use crate::prompt::{self, Dialog};
use crate::state::{InstanceRecord, PackageManager, StateTracker};

use cloudinit::{AGENT_UID, AGENT_USER, UserData};
pub use readiness::Readiness;
use ssh::SshKeys;

pub const SANDBOX_PROFILE: &str = "agent-sandbox";
pub const PROCESS_LIMIT: u32 = 500;
pub const WORKSPACE_DEVICE: &str = "workspace";
pub const WORKSPACE_PATH: &str = "/workspace";
const ROOT_DEVICE: &str = "root";
const BUILDER_CONTAINER: &str = "coop-image-builder";
const BUILDER_SNAPSHOT: &str = "build";
const IPV4_WAIT: Duration = Duration::from_secs(30);
const ENV_FILE: &str = "/home/agent/.bashrc.d/10-coop-env.sh";

/// How the host reaches containers, as reported by the backend.
#[derive(Debug, Clone, Default)]
pub struct HostAccess {
    pub ssh_proxy_args: Vec<String>,
    pub use_incus_exec: bool,
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub ssh_public_key: Option<String>,
    pub workdir: Option<PathBuf>,
    pub readiness: Readiness,
    pub interactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub name: String,
    pub image: String,
    pub ipv4: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInfo {
    pub name: String,
    pub source: String,
    pub path: String,
    pub readonly: bool,
}

impl MountInfo {
    fn from_device(name: &str, device: &Device) -> Option<Self> {
        if name == ROOT_DEVICE || device.get("type").map(String::as_str) != Some("disk") {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            source: device.get("source").cloned().unwrap_or_default(),
            path: device.get("path").cloned().unwrap_or_default(),
            readonly: device.get("readonly").is_some_and(|v| v == "true"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MountRequest {
    pub name: String,
    pub source: String,
    pub path: String,
    pub readonly: bool,
    pub force: bool,
}

/// One row of `coop list`.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub name: String,
    pub status: String,
    pub ipv4: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub instance: Instance,
    pub ipv4: Option<String>,
    pub record: Option<InstanceRecord>,
    pub mounts: Vec<MountInfo>,
}

pub struct SandboxManager {
    client: IncusClient,
    settings: Settings,
    instances_dir: PathBuf,
    ssh: SshKeys,
    guard: MountGuard,
    authorizer: Box<dyn Authorizer>,
    images: ImageRegistry,
    access: HostAccess,
}

impl SandboxManager {
    pub fn new(
        client: IncusClient,
        settings: Settings,
        dirs: &Dirs,
        access: HostAccess,
    ) -> Result<Self> {
        let guard = MountGuard::for_user(dirs)?;
        let auth = AuthCode::new(dirs.seatbelt_key_path());
        Self::with_guard(client, settings, dirs, access, guard, Box::new(auth))
    }

    pub fn with_guard(
        client: IncusClient,
        settings: Settings,
        dirs: &Dirs,
        access: HostAccess,
        guard: MountGuard,
        authorizer: Box<dyn Authorizer>,
    ) -> Result<Self> {
        Ok(Self {
            images: ImageRegistry::load(&dirs.image_registry_path())?,
            client,
            settings,
            instances_dir: dirs.instances_dir(),
            ssh: SshKeys::new(dirs.ssh_dir()),
            guard,
            authorizer,
            access,
        })
    }

    pub fn client(&self) -> &IncusClient {
        &self.client
    }

    pub fn ssh_keys(&self) -> &SshKeys {
        &self.ssh
    }

    pub fn images(&self) -> &ImageRegistry {
        &self.images
    }

    fn tracker(&self, name: &str) -> Result<StateTracker> {
        StateTracker::open(&self.instances_dir, name)
    }

    fn status(&self, name: &str) -> Result<ContainerStatus> {
        names::validate_container_name(name)?;
        Ok(self.client.get_container(name)?.status())
    }

    // ---- create ----

    pub fn create(
        &self,
        req: &CreateRequest,
        out: &mut dyn Write,
        sleep: &mut dyn FnMut(Duration),
    ) -> Result<Created> {
        let name = req.name.as_str();
        names::validate_container_name(name)?;
        match self.client.get_container(name) {
            Ok(_) => {
                return Err(Error::AlreadyExists {
                    what: "container",
                    name: name.to_string(),
                });
            }
            Err(e) if e.is(ErrorKind::NotFound) => {}
            Err(e) => return Err(e),
        }

        let workspace = match &req.workdir {
            Some(dir) => Some(self.checked_source(&dir.to_string_lossy(), false)?),
            None => None,
        };

        let user_data = UserData {
            hostname: name.to_string(),
            ssh_public_key: req.ssh_public_key.clone(),
            env: BTreeMap::new(),
        }
        .render()?;

        let pool = self.settings.container.storage_pool();
        let size = format!("{}GiB", req.disk_gb);
        let profile_devices = BTreeMap::from([(
            ROOT_DEVICE.to_string(),
            device(&[
                ("type", "disk"),
                ("path", "/"),
                ("pool", pool),
                ("size", size.as_str()),
            ]),
        )]);
        let profile_config = BTreeMap::from([("security.nesting".to_string(), "true".to_string())]);
        self.client
            .ensure_profile(SANDBOX_PROFILE, &profile_config, &profile_devices)
            .ctx(|| format!("ensure profile {}", SANDBOX_PROFILE))?;

        let mut devices = BTreeMap::new();
        if let Some(source) = &workspace {
            let source = source.to_string_lossy();
            devices.insert(
                WORKSPACE_DEVICE.to_string(),
                device(&[
                    ("type", "disk"),
                    ("source", source.as_ref()),
                    ("path", WORKSPACE_PATH),
                ]),
            );
        }

        let source = self.resolve_image(req, out, sleep)?;
        let config = container_config(req.cpus, req.memory_mb, host_uid(), &user_data);
        let profiles = vec!["default".to_string(), SANDBOX_PROFILE.to_string()];
        writeln!(out, "Creating {} from {}", name, source.display_ref())?;
        self.client
            .create_container(name, &source, &config, &profiles, &devices)?;

        let tracker = StateTracker::create(&self.instances_dir, name, source.display_ref())?;
        if let Some(src) = &workspace {
            tracker.record_mount(
                WORKSPACE_DEVICE,
                &src.to_string_lossy(),
                WORKSPACE_PATH,
                false,
            )?;
        }

        self.client
            .start_container(name)
            .ctx(|| format!("start {}", name))?;
        writeln!(out, "Waiting for cloud-init")?;
        req.readiness.wait(&self.client, name, out, sleep)?;

        let ipv4 = match self.client.wait_for_condition(
            name,
            Condition::HasIpv4,
            IPV4_WAIT,
            Duration::from_secs(1),
        ) {
            Ok(()) => self.client.get_container_ipv4(name)?,
            Err(e) if e.is(ErrorKind::Timeout) => {
                warn!(container = name, "sandbox:no IPv4 address after cloud-init");
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(ip) = &ipv4 {
            if let Err(e) = self.ssh.upsert_host(name, ip, &self.access.ssh_proxy_args) {
                warn!(container = name, error = %e, "sandbox:ssh config update failed");
            }
        }
        info!(container = name, image = source.display_ref(), ipv4 = ?ipv4, "sandbox:created");
        Ok(Created {
            name: name.to_string(),
            image: source.display_ref().to_string(),
            ipv4,
        })
    }

    fn resolve_image(
        &self,
        req: &CreateRequest,
        out: &mut dyn Write,
        sleep: &mut dyn FnMut(Duration),
    ) -> Result<ImageSource> {
        let default = self.settings.default_image();
        if default.contains('/') {
            return Ok(ImageSource::from_ref(default));
        }
        if self.client.image_exists(default)? {
            return Ok(ImageSource::Alias(default.to_string()));
        }
        if req.interactive && prompt::is_interactive() {
            let build = Dialog {
                title: "Base image missing",
                lines: vec![
                    format!("The image '{}' is not available locally.", default),
                    "Building it takes a few minutes but makes later creates fast.".to_string(),
                ],
                question: "Build it now?",
                default_yes: true,
            }
            .confirm()?;
            if build {
                self.build_image(&req.readiness, out, sleep)?;
                return Ok(ImageSource::Alias(default.to_string()));
            }
        }
        let fallback = self.fallback_source();
        warn!(default, fallback = fallback.display_ref(), "sandbox:default image missing");
        writeln!(
            out,
            "Image '{}' not found locally; using {}",
            default,
            fallback.display_ref()
        )?;
        Ok(fallback)
    }

    fn fallback_source(&self) -> ImageSource {
        match &self.settings.fallback_fingerprint {
            Some(fp) => ImageSource::Pinned {
                server: DEFAULT_IMAGE_SERVER.to_string(),
                fingerprint: fp.clone(),
            },
            None => ImageSource::from_ref(self.settings.fallback_image()),
        }
    }

    // ---- lifecycle ----

    /// No-op when already running.
    pub fn start(&self, name: &str) -> Result<()> {
        match self.status(name)? {
            ContainerStatus::Running => Ok(()),
            ContainerStatus::Frozen => Err(invalid(name, ContainerStatus::Frozen, "start")),
            _ => self.client.start_container(name),
        }
    }

    pub fn stop(&self, name: &str, force: bool) -> Result<()> {
        match self.status(name)? {
            ContainerStatus::Stopped => Ok(()),
            ContainerStatus::Frozen if !force => {
                Err(invalid(name, ContainerStatus::Frozen, "stop without --force"))
            }
            _ => self.client.stop_container(name, force),
        }
    }

    pub fn freeze(&self, name: &str) -> Result<()> {
        match self.status(name)? {
            ContainerStatus::Running => self.client.freeze_container(name),
            other => Err(invalid(name, other, "lock")),
        }
    }

    pub fn unfreeze(&self, name: &str) -> Result<()> {
        match self.status(name)? {
            ContainerStatus::Frozen => self.client.unfreeze_container(name),
            other => Err(invalid(name, other, "unlock")),
        }
    }

    /// Stop (honoring `force`), remove, and forget local state.
    pub fn delete(&self, name: &str, force: bool) -> Result<()> {
        let status = self.status(name)?;
        if status != ContainerStatus::Stopped {
            if status == ContainerStatus::Frozen && !force {
                return Err(invalid(name, status, "delete without --force"));
            }
            self.client
                .stop_container(name, force)
                .ctx(|| format!("stop {} before delete", name))?;
        }
        self.client.delete_container(name, false)?;
        StateTracker::remove(&self.instances_dir, name)?;
        if let Err(e) = self.ssh.remove_host(name) {
            warn!(container = name, error = %e, "sandbox:ssh config cleanup failed");
        }
        info!(container = name, "sandbox:deleted");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .client
            .list_containers("")?
            .into_iter()
            .map(|i| ContainerSummary {
                ipv4: i.state.as_ref().and_then(|s| s.first_global("inet")),
                status: i.status().to_string(),
                created_at: i.created_at.clone(),
                name: i.name,
            })
            .collect())
    }

    pub fn info(&self, name: &str) -> Result<ContainerInfo> {
        names::validate_container_name(name)?;
        let instance = self.client.get_container(name)?;
        let ipv4 = match instance.status() {
            ContainerStatus::Running => self.client.get_container_ipv4(name)?,
            _ => None,
        };
        let record = match self.tracker(name) {
            Ok(t) => Some(t.state()?),
            Err(e) => {
                debug!(container = name, error = %e, "sandbox:no tracked state");
                None
            }
        };
        let mounts = instance
            .devices
            .iter()
            .filter_map(|(n, d)| MountInfo::from_device(n, d))
            .collect();
        Ok(ContainerInfo {
            instance,
            ipv4,
            record,
            mounts,
        })
    }

    pub fn logs(&self, name: &str) -> Result<String> {
        names::validate_container_name(name)?;
        let bytes = self.client.pull_file(name, readiness::OUTPUT_LOG)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // ---- snapshots ----

    pub fn snapshot(&self, name: &str, snapshot: &str, note: &str) -> Result<()> {
        names::validate_component("snapshot", snapshot)?;
        let status = self.status(name)?;
        if status == ContainerStatus::Frozen {
            return Err(invalid(name, status, "snapshot"));
        }
        let tracker = self.tracker(name)?;
        let restarted = self.with_stopped(name, status, "snapshot", snapshot, || {
            self.client.create_snapshot(name, snapshot)
        })?;
        tracker.record_snapshot(snapshot, note)?;
        info!(container = name, snapshot, "sandbox:snapshot");
        restarted
    }

    /// Roll the container back and reset tracked state to the entry linked
    /// to `snapshot`. Returns the restored record when a link existed.
    pub fn restore(&self, name: &str, snapshot: &str) -> Result<Option<InstanceRecord>> {
        names::validate_component("snapshot", snapshot)?;
        let status = self.status(name)?;
        if status == ContainerStatus::Frozen {
            return Err(invalid(name, status, "restore"));
        }
        let tracker = self.tracker(name)?;
        let restarted = self.with_stopped(name, status, "restore", snapshot, || {
            self.client.restore_snapshot(name, snapshot)
        })?;
        let record = match tracker.undo_to_snapshot(snapshot) {
            Ok(record) => Some(record),
            Err(e) if e.is(ErrorKind::NotFound) => {
                warn!(container = name, snapshot, "sandbox:snapshot has no history link");
                None
            }
            Err(e) => return Err(e),
        };
        restarted.map(|()| record)
    }

    /// Stop a running container around `op`, restarting it afterwards.
    ///
    /// The outer result fails when stopping or `op` failed; a failed `op`
    /// still gets a best-effort restart. The inner result is the restart
    /// after a successful `op`, so callers can record `op` before reporting
    /// a failed restart.
    fn with_stopped(
        &self,
        name: &str,
        status: ContainerStatus,
        what: &str,
        snapshot: &str,
        op: impl FnOnce() -> Result<()>,
    ) -> Result<Result<()>> {
        let was_running = status == ContainerStatus::Running;
        if was_running {
            self.client
                .stop_container(name, false)
                .ctx(|| format!("stop {} before {}", name, what))?;
        }
        if let Err(e) = op() {
            if was_running && let Err(restart) = self.client.start_container(name) {
                warn!(container = name, error = %restart, "sandbox:restart after failed {} failed", what);
            }
            return Err(e);
        }
        if !was_running {
            return Ok(Ok(()));
        }
        Ok(self.client.start_container(name).map_err(|e| {
            e.context(format!(
                "{} '{}' succeeded but failed to restart {}",
                what, snapshot, name
            ))
        }))
    }

    pub fn list_snapshots(&self, name: &str) -> Result<Vec<Snapshot>> {
        names::validate_container_name(name)?;
        self.client.list_snapshots(name)
    }

    pub fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        names::validate_container_name(name)?;
        names::validate_component("snapshot", snapshot)?;
        self.client.delete_snapshot(name, snapshot)?;
        self.tracker(name)?.forget_snapshot(snapshot)
    }

    // ---- mounts ----

    /// Resolve a host path and apply the guard. Guarded paths need `force`
    /// plus a second factor; the config root is refused outright.
    fn checked_source(&self, source: &str, force: bool) -> Result<PathBuf> {
        if self.guard.is_hard_blocked(source)? {
            return Err(Error::Seatbelted {
                path: source.to_string(),
                reason: "the coop configuration directory can never be mounted".into(),
            });
        }
        let verdict = self.guard.is_seatbelted(source)?;
        if verdict.seatbelted {
            if !force {
                return Err(Error::Seatbelted {
                    path: source.to_string(),
                    reason: verdict.reason,
                });
            }
            self.authorizer.authorize(source, &verdict.reason)?;
            warn!(path = source, reason = %verdict.reason, "sandbox:guarded path authorized");
        }
        if !verdict.resolved.exists() {
            return Err(Error::not_found("path", verdict.resolved.display().to_string()));
        }
        Ok(verdict.resolved)
    }

    pub fn mount(&self, container: &str, req: &MountRequest) -> Result<MountInfo> {
        names::validate_container_name(container)?;
        names::validate_component("mount", &req.name)?;
        if req.name == ROOT_DEVICE {
            return Err(Error::invalid_name(
                "mount",
                &req.name,
                "reserved for the root disk",
            ));
        }
        if !req.path.starts_with('/') {
            return Err(Error::invalid_name(
                "mount path",
                &req.path,
                "must be an absolute path inside the container",
            ));
        }
        let resolved = self.checked_source(&req.source, req.force)?;
        let source = resolved.to_string_lossy().into_owned();

        let mut fields = vec![("type", "disk"), ("source", source.as_str()), ("path", req.path.as_str())];
        if req.readonly {
            fields.push(("readonly", "true"));
        }
        self.client.add_device(container, &req.name, device(&fields))?;
        self.tracker(container)?
            .record_mount(&req.name, &source, &req.path, req.readonly)?;
        info!(container, mount = %req.name, source = %source, "sandbox:mounted");
        Ok(MountInfo {
            name: req.name.clone(),
            source,
            path: req.path.clone(),
            readonly: req.readonly,
        })
    }

    pub fn unmount(&self, container: &str, mount: &str) -> Result<()> {
        names::validate_container_name(container)?;
        names::validate_component("mount", mount)?;
        if mount == ROOT_DEVICE {
            return Err(Error::invalid_name("mount", mount, "reserved for the root disk"));
        }
        self.client.remove_device(container, mount)?;
        self.tracker(container)?.record_unmount(mount)?;
        Ok(())
    }

    pub fn mounts(&self, container: &str) -> Result<Vec<MountInfo>> {
        names::validate_container_name(container)?;
        Ok(self
            .client
            .list_devices(container)?
            .iter()
            .filter_map(|(n, d)| MountInfo::from_device(n, d))
            .collect())
    }

    // ---- exec & ssh ----

    pub fn exec(&self, name: &str, argv: &[&str]) -> Result<i32> {
        self.require_running(name, "exec")?;
        self.client.exec(name, argv, &BTreeMap::new())
    }

    pub fn exec_output(&self, name: &str, argv: &[&str]) -> Result<ExecOutput> {
        self.require_running(name, "exec")?;
        self.client.exec_output(name, argv, &BTreeMap::new())
    }

    fn require_running(&self, name: &str, action: &'static str) -> Result<()> {
        match self.status(name)? {
            ContainerStatus::Running => Ok(()),
            other => Err(invalid(name, other, action)),
        }
    }

    fn ipv4(&self, name: &str) -> Result<String> {
        self.require_running(name, "connect")?;
        self.client
            .get_container_ipv4(name)?
            .ok_or_else(|| Error::not_found("IPv4 address", name))
    }

    pub fn ssh_args(&self, name: &str) -> Result<Vec<String>> {
        let ip = self.ipv4(name)?;
        Ok(self.ssh.ssh_args(&ip, &self.access.ssh_proxy_args))
    }

    pub fn ssh_command(&self, name: &str) -> Result<String> {
        let ip = self.ipv4(name)?;
        Ok(self.ssh.ssh_command(&ip, &self.access.ssh_proxy_args))
    }

    /// Interactive login as the agent user. Goes through the Incus exec API
    /// when containers are unreachable from the host or have no address.
    pub fn shell(&self, name: &str) -> Result<i32> {
        self.require_running(name, "open a shell")?;
        let login = ["/bin/bash", "-lc", "exec su - agent"];
        if self.access.use_incus_exec {
            return self.client.exec(name, &login, &BTreeMap::new());
        }
        match self.client.get_container_ipv4(name)? {
            Some(ip) => {
                let args = self.ssh.ssh_args(&ip, &self.access.ssh_proxy_args);
                crate::cmd::Cmd::new(&args[0]).args(&args[1..]).run_interactive()
            }
            None => self.client.exec(name, &login, &BTreeMap::new()),
        }
    }

    // ---- packages & env ----

    pub fn install(&self, name: &str, manager: PackageManager, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Err(Error::invalid_name("package list", "", "no packages given"));
        }
        if let Some(argv) = install_command(manager, packages) {
            self.require_running(name, "install packages")?;
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            let env = BTreeMap::from([(
                "DEBIAN_FRONTEND".to_string(),
                "noninteractive".to_string(),
            )]);
            let code = self.client.exec(name, &argv, &env)?;
            if code != 0 {
                return Err(Error::Transport(format!(
                    "{} install in {} exited with {}",
                    manager, name, code
                )));
            }
        }
        self.tracker(name)?.record_package_install(manager, packages)?;
        Ok(())
    }

    /// Record an environment variable and, when the container is running,
    /// rewrite the agent's env file. Returns whether the file was written.
    pub fn set_env(&self, name: &str, key: &str, value: &str) -> Result<bool> {
        names::validate_container_name(name)?;
        let tracker = self.tracker(name)?;
        tracker.record_env(key, value)?;
        if self.status(name)? != ContainerStatus::Running {
            return Ok(false);
        }
        let record = tracker.state()?;
        let lines: Vec<String> = record
            .env
            .iter()
            .map(|(k, v)| format!("export {}={}", k, cloudinit::shell_quote(v)))
            .collect();
        let script = format!(
            "mkdir -p \"$(dirname {f})\" && printf '%s\\n' \"$@\" > {f} && chown -R {u}:{u} \"$(dirname {f})\"",
            f = ENV_FILE,
            u = AGENT_USER
        );
        let mut argv = vec!["sh", "-c", script.as_str(), "sh"];
        argv.extend(lines.iter().map(String::as_str));
        self.client.exec_capture(name, &argv)?;
        Ok(true)
    }

    // ---- images ----

    pub fn publish(&self, container: &str, snapshot: &str, alias: &str) -> Result<String> {
        names::validate_container_name(container)?;
        names::validate_component("snapshot", snapshot)?;
        names::validate_component("image alias", alias)?;
        let fingerprint = self.client.publish_snapshot(container, snapshot, alias)?;
        self.images
            .record_publish(alias, &fingerprint, container, snapshot)?;
        Ok(fingerprint)
    }

    pub fn list_images(&self) -> Result<Vec<Image>> {
        self.client.list_images()
    }

    pub fn image_exists(&self, alias: &str) -> Result<bool> {
        self.client.image_exists(alias)
    }

    /// Drop the alias and its lineage record. With `purge`, the image itself
    /// is deleted too when no other alias points at it.
    pub fn remove_image(&self, alias: &str, purge: bool) -> Result<()> {
        let orphan = if purge {
            self.client
                .list_images()?
                .into_iter()
                .find(|img| img.aliases.len() == 1 && img.aliases[0].name == alias)
        } else {
            None
        };
        match self.client.delete_image_alias(alias) {
            Ok(()) => {}
            Err(e) if e.is(ErrorKind::NotFound) && self.images.get(alias)?.is_some() => {
                warn!(alias, "sandbox:alias already gone, dropping registry entry");
            }
            Err(e) => return Err(e),
        }
        self.images.remove(alias)?;
        if let Some(image) = orphan {
            self.client.delete_image(&image.fingerprint)?;
            info!(alias, fingerprint = %image.fingerprint, "sandbox:image purged");
        }
        Ok(())
    }

    /// Build the default image: boot a builder from the fallback image,
    /// let cloud-init finish, publish it under the default alias and
    /// throw the builder away.
    pub fn build_image(
        &self,
        readiness: &Readiness,
        out: &mut dyn Write,
        sleep: &mut dyn FnMut(Duration),
    ) -> Result<String> {
        let alias = self.settings.default_image().to_string();
        names::validate_component("image alias", &alias)?;
        if self.client.get_container(BUILDER_CONTAINER).is_ok() {
            self.client.delete_container(BUILDER_CONTAINER, true)?;
        }

        let source = self.fallback_source();
        writeln!(out, "Building {} from {}", alias, source.display_ref())?;
        let user_data = UserData {
            hostname: BUILDER_CONTAINER.to_string(),
            ..UserData::default()
        }
        .render()?;
        let config = BTreeMap::from([("user.user-data".to_string(), user_data)]);
        self.client.create_container(
            BUILDER_CONTAINER,
            &source,
            &config,
            &["default".to_string()],
            &BTreeMap::new(),
        )?;

        let result = self.finish_build(&alias, readiness, out, sleep);
        if let Err(e) = self.client.delete_container(BUILDER_CONTAINER, true) {
            warn!(error = %e, "sandbox:builder cleanup failed");
        }
        let fingerprint = result?;
        self.images
            .record_publish(&alias, &fingerprint, BUILDER_CONTAINER, BUILDER_SNAPSHOT)?;
        writeln!(out, "Published {} ({})", alias, short_fingerprint(&fingerprint))?;
        Ok(fingerprint)
    }

    fn finish_build(
        &self,
        alias: &str,
        readiness: &Readiness,
        out: &mut dyn Write,
        sleep: &mut dyn FnMut(Duration),
    ) -> Result<String> {
        self.client.start_container(BUILDER_CONTAINER)?;
        readiness.wait(&self.client, BUILDER_CONTAINER, out, sleep)?;
        // Containers created from the image must run cloud-init again.
        match self
            .client
            .exec_output(BUILDER_CONTAINER, &["cloud-init", "clean", "--logs"], &BTreeMap::new())
        {
            Ok(o) if o.exit_code == 0 => {}
            Ok(o) => warn!(code = o.exit_code, stderr = %o.stderr.trim(), "sandbox:cloud-init clean failed"),
            Err(e) => warn!(error = %e, "sandbox:cloud-init clean failed"),
        }
        self.client.stop_container(BUILDER_CONTAINER, false)?;
        self.client.create_snapshot(BUILDER_CONTAINER, BUILDER_SNAPSHOT)?;
        if self.client.image_exists(alias)? {
            self.client.delete_image_alias(alias)?;
        }
        self.client
            .publish_snapshot(BUILDER_CONTAINER, BUILDER_SNAPSHOT, alias)
    }
}

fn invalid(name: &str, status: ContainerStatus, action: &'static str) -> Error {
    Error::InvalidState {
        name: name.to_string(),
        state: status.to_string(),
        action,
    }
}

fn device(fields: &[(&str, &str)]) -> Device {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn host_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

fn container_config(
    cpus: u32,
    memory_mb: u64,
    uid: u32,
    user_data: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("limits.cpu".to_string(), cpus.to_string()),
        ("limits.memory".to_string(), format!("{}MiB", memory_mb)),
        ("limits.processes".to_string(), PROCESS_LIMIT.to_string()),
        ("raw.idmap".to_string(), format!("both {} {}", uid, AGENT_UID)),
        ("user.user-data".to_string(), user_data.to_string()),
    ])
}

/// argv that installs `packages` with `manager`; `None` for managers coop
/// only records.
fn install_command(manager: PackageManager, packages: &[String]) -> Option<Vec<String>> {
    let as_agent = |tool: &[&str]| -> Vec<String> {
        ["sudo", "-u", AGENT_USER, "-i"]
            .iter()
            .chain(tool)
            .map(|s| s.to_string())
            .chain(packages.iter().cloned())
            .collect()
    };
    let as_root = |tool: &[&str]| -> Vec<String> {
        tool.iter()
            .map(|s| s.to_string())
            .chain(packages.iter().cloned())
            .collect()
    };
    match manager {
        PackageManager::Apt => Some(as_root(&["apt-get", "install", "-y"])),
        PackageManager::Npm => Some(as_root(&["npm", "install", "-g"])),
        PackageManager::Pip => Some(as_agent(&["pip", "install", "--user"])),
        PackageManager::Go => Some(as_agent(&["go", "install"])),
        PackageManager::Cargo => Some(as_agent(&["cargo", "install"])),
        PackageManager::Brew => Some(as_agent(&["brew", "install"])),
        PackageManager::Custom => None,
    }
}

pub fn short_fingerprint(fp: &str) -> &str {
    &fp[..fp.len().min(12)]
}
