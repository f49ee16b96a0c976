//! `coop doctor`: environment checks with optional repairs.

use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use super::App;
use crate::backend::{BackendManager, VmState};
use crate::config::Dirs;
use crate::error::ErrorKind;
use crate::fsutil::{self, PRIVATE_FILE_MODE};
use crate::incus::IncusClient;
use crate::incus::types::StoragePoolResources;
use crate::sandbox::SANDBOX_PROFILE;
use crate::sandbox::ssh::SshKeys;
use crate::theme;

/// Pool usage above this fraction is a warning.
const POOL_WARN_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Warn,
    Fail,
    Skip,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Pass => "pass",
            Outcome::Warn => "warn",
            Outcome::Fail => "fail",
            Outcome::Skip => "skip",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Check {
    pub name: &'static str,
    pub outcome: Outcome,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            name,
            outcome,
            detail: detail.into(),
        }
    }
}

/// Returns the exit code: 1 when any check failed.
pub fn run(app: &App, fix: bool) -> Result<i32> {
    if fix {
        apply_fixes(&app.dirs);
    }
    let checks = collect(app);
    let t = theme::current();
    for c in &checks {
        let label = format!("{:<5}", c.outcome.to_string());
        let label = match c.outcome {
            Outcome::Pass => t.ok(label),
            Outcome::Warn => t.warn(label),
            Outcome::Fail => t.error(label),
            Outcome::Skip => t.muted(label),
        };
        println!("{} {:<14} {}", label, c.name, c.detail);
    }
    let code = exit_code(&checks);
    if code != 0 && !fix {
        println!();
        println!("{}", t.muted("Run `coop doctor --fix` to repair local files."));
    }
    Ok(code)
}

pub fn exit_code(checks: &[Check]) -> i32 {
    if checks.iter().any(|c| c.outcome == Outcome::Fail) {
        1
    } else {
        0
    }
}

fn collect(app: &App) -> Vec<Check> {
    let mut checks = vec![
        Check::new(
            "platform",
            Outcome::Pass,
            format!("{} {}", app.platform.os, app.platform.arch),
        ),
        check_dirs(&app.dirs),
    ];

    let client = if app.uses_vm() {
        match app.backends() {
            Ok(manager) => {
                checks.push(Check::new(
                    "backend",
                    Outcome::Pass,
                    manager.selected().name(),
                ));
                let (vm, client) = check_vm(&manager);
                checks.push(vm);
                client
            }
            Err(e) => {
                checks.push(Check::new("backend", Outcome::Fail, format!("{:#}", e)));
                checks.push(Check::new("vm", Outcome::Skip, "no backend"));
                None
            }
        }
    } else {
        checks.push(Check::new("backend", Outcome::Skip, "native Incus"));
        Some(IncusClient::unix(app.native_socket()))
    };

    match client {
        Some(client) => match client.server_info() {
            Ok(_) => {
                checks.push(Check::new("incus", Outcome::Pass, client.endpoint().to_string()));
                checks.push(check_image(&client, app.settings.default_image()));
                let pool = app.settings.container.storage_pool();
                checks.push(match client.storage_pool_resources(pool) {
                    Ok(res) => check_pool(pool, &res),
                    Err(e) => Check::new("storage", Outcome::Warn, format!("{}: {}", pool, e)),
                });
                checks.push(check_profile(&client));
            }
            Err(e) => {
                checks.push(Check::new("incus", Outcome::Fail, e.to_string()));
                checks.push(Check::new("image", Outcome::Skip, "Incus unreachable"));
                checks.push(Check::new("storage", Outcome::Skip, "Incus unreachable"));
                checks.push(Check::new("profile", Outcome::Skip, "Incus unreachable"));
            }
        },
        None => {
            checks.push(Check::new("incus", Outcome::Skip, "VM not running"));
            checks.push(Check::new("image", Outcome::Skip, "VM not running"));
            checks.push(Check::new("storage", Outcome::Skip, "VM not running"));
            checks.push(Check::new("profile", Outcome::Skip, "VM not running"));
        }
    }

    checks.push(check_ssh_key(&SshKeys::new(app.dirs.ssh_dir())));
    checks.push(check_seatbelt_key(&app.dirs.seatbelt_key_path()));
    checks
}

fn check_dirs(dirs: &Dirs) -> Check {
    let missing: Vec<String> = [&dirs.config, &dirs.data, &dirs.cache]
        .into_iter()
        .filter(|d| !d.is_dir())
        .map(|d| d.display().to_string())
        .collect();
    if missing.is_empty() {
        Check::new("directories", Outcome::Pass, dirs.config.display().to_string())
    } else {
        Check::new(
            "directories",
            Outcome::Warn,
            format!("missing {}", missing.join(", ")),
        )
    }
}

/// VM state, plus a client when the VM is up.
fn check_vm(manager: &BackendManager) -> (Check, Option<IncusClient>) {
    let backend = manager.selected();
    let status = match backend.status() {
        Ok(s) => s,
        Err(e) => return (Check::new("vm", Outcome::Fail, e.to_string()), None),
    };
    if status.state != VmState::Running {
        let check = Check::new(
            "vm",
            Outcome::Warn,
            format!("{} is {}; run `coop vm start`", status.name, status.state),
        );
        return (check, None);
    }
    let client = backend.incus_endpoint().and_then(|endpoint| {
        let remote = backend.remote_registration().map(|r| r.remote_name);
        IncusClient::connect(&endpoint, &backend.tls_material(), remote)
    });
    match client {
        Ok(client) => (
            Check::new("vm", Outcome::Pass, format!("{} running", status.name)),
            Some(client),
        ),
        Err(e) => (
            Check::new("vm", Outcome::Fail, format!("{} running but {}", status.name, e)),
            None,
        ),
    }
}

fn check_image(client: &IncusClient, alias: &str) -> Check {
    match client.image_exists(alias) {
        Ok(true) => Check::new("image", Outcome::Pass, alias),
        Ok(false) => Check::new(
            "image",
            Outcome::Warn,
            format!("{} missing; run `coop image build`", alias),
        ),
        Err(e) => Check::new("image", Outcome::Fail, e.to_string()),
    }
}

fn check_pool(pool: &str, res: &StoragePoolResources) -> Check {
    if res.space.total == 0 {
        return Check::new("storage", Outcome::Warn, format!("{}: size unknown", pool));
    }
    let ratio = res.space.used as f64 / res.space.total as f64;
    let detail = format!(
        "{}: {:.1} of {:.1} GiB used",
        pool,
        res.space.used as f64 / GIB,
        res.space.total as f64 / GIB
    );
    let outcome = if ratio > POOL_WARN_RATIO {
        Outcome::Warn
    } else {
        Outcome::Pass
    };
    Check::new("storage", outcome, detail)
}

fn check_profile(client: &IncusClient) -> Check {
    match client.get_profile(SANDBOX_PROFILE) {
        Ok(profile) => Check::new(
            "profile",
            Outcome::Pass,
            format!("{} ({} devices)", SANDBOX_PROFILE, profile.devices.len()),
        ),
        Err(e) if e.is(ErrorKind::NotFound) => Check::new(
            "profile",
            Outcome::Skip,
            format!("{} is created on first `coop create`", SANDBOX_PROFILE),
        ),
        Err(e) => Check::new("profile", Outcome::Fail, e.to_string()),
    }
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn check_ssh_key(keys: &SshKeys) -> Check {
    let key = keys.private_key();
    if !key.exists() {
        return Check::new("ssh key", Outcome::Warn, "missing; created on first `coop create`");
    }
    match fsutil::mode_of(&key) {
        Ok(mode) if mode & 0o077 != 0 => Check::new(
            "ssh key",
            Outcome::Fail,
            format!("{} has mode {:o}, expected 600", key.display(), mode),
        ),
        Ok(_) => Check::new("ssh key", Outcome::Pass, key.display().to_string()),
        Err(e) => Check::new("ssh key", Outcome::Fail, e.to_string()),
    }
}

fn check_seatbelt_key(path: &Path) -> Check {
    if !path.exists() {
        return Check::new("seatbelt key", Outcome::Skip, "not created yet");
    }
    match fsutil::mode_of(path) {
        Ok(PRIVATE_FILE_MODE) => Check::new("seatbelt key", Outcome::Pass, path.display().to_string()),
        Ok(mode) => Check::new(
            "seatbelt key",
            Outcome::Fail,
            format!("{} has mode {:o}, expected 600", path.display(), mode),
        ),
        Err(e) => Check::new("seatbelt key", Outcome::Fail, e.to_string()),
    }
}

/// Best effort; each failure is logged and the checks report what is left.
fn apply_fixes(dirs: &Dirs) {
    if let Err(e) = dirs.ensure() {
        warn!(error = %e, "doctor:create directories failed");
    }
    let keys = SshKeys::new(dirs.ssh_dir());
    if let Err(e) = keys.ensure_key() {
        warn!(error = %e, "doctor:ssh key generation failed");
    }
    for path in [keys.private_key(), dirs.seatbelt_key_path()] {
        if path.exists() {
            match fs::set_permissions(&path, fs::Permissions::from_mode(PRIVATE_FILE_MODE)) {
                Ok(()) => info!(path = %path.display(), "doctor:permissions tightened"),
                Err(e) => warn!(path = %path.display(), error = %e, "doctor:chmod failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incus::fake::FakeIncus;
    use crate::incus::types::UsedTotal;
    use tempfile::TempDir;

    #[test]
    fn exit_code_fails_only_on_fail() {
        let mut checks = vec![
            Check::new("a", Outcome::Pass, ""),
            Check::new("b", Outcome::Warn, ""),
            Check::new("c", Outcome::Skip, ""),
        ];
        assert_eq!(exit_code(&checks), 0);
        checks.push(Check::new("d", Outcome::Fail, ""));
        assert_eq!(exit_code(&checks), 1);
    }

    #[test]
    fn seatbelt_key_mode_is_checked() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("seatbelt.key");
        assert_eq!(check_seatbelt_key(&key).outcome, Outcome::Skip);

        fs::write(&key, "SECRET").unwrap();
        fs::set_permissions(&key, fs::Permissions::from_mode(0o644)).unwrap();
        let check = check_seatbelt_key(&key);
        assert_eq!(check.outcome, Outcome::Fail);
        assert!(check.detail.contains("644"));

        fs::set_permissions(&key, fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(check_seatbelt_key(&key).outcome, Outcome::Pass);
    }

    #[test]
    fn fix_creates_dirs_and_tightens_modes() {
        let dir = TempDir::new().unwrap();
        let dirs = Dirs::rooted(dir.path());
        assert_eq!(check_dirs(&dirs).outcome, Outcome::Warn);

        fs::create_dir_all(&dirs.config).unwrap();
        let key = dirs.seatbelt_key_path();
        fs::write(&key, "SECRET").unwrap();
        fs::set_permissions(&key, fs::Permissions::from_mode(0o640)).unwrap();

        apply_fixes(&dirs);
        assert_eq!(check_dirs(&dirs).outcome, Outcome::Pass);
        assert_eq!(fsutil::mode_of(&key).unwrap(), 0o600);
    }

    #[test]
    fn profile_check_skips_until_first_create() {
        let sim = FakeIncus::simulated();
        let client = sim.client();
        assert_eq!(check_profile(&client).outcome, Outcome::Skip);
        client
            .ensure_profile(SANDBOX_PROFILE, &Default::default(), &Default::default())
            .unwrap();
        assert_eq!(check_profile(&client).outcome, Outcome::Pass);
    }

    #[test]
    fn missing_image_is_a_warning() {
        let sim = FakeIncus::simulated();
        let client = sim.client();
        assert_eq!(check_image(&client, "coop-agent-base").outcome, Outcome::Warn);
        sim.add_image_alias("coop-agent-base");
        assert_eq!(check_image(&client, "coop-agent-base").outcome, Outcome::Pass);
    }

    #[test]
    fn nearly_full_pool_warns() {
        let res = |used, total| StoragePoolResources {
            space: UsedTotal { used, total },
            inodes: UsedTotal::default(),
        };
        assert_eq!(check_pool("default", &res(5, 100)).outcome, Outcome::Pass);
        assert_eq!(check_pool("default", &res(95, 100)).outcome, Outcome::Warn);
        assert_eq!(check_pool("default", &res(0, 0)).outcome, Outcome::Warn);
    }
}
