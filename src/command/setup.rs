//! `init`, `config`, `env` and `version`.

use anyhow::{Context, Result};

use super::App;
use crate::sandbox::ssh::SshKeys;
use crate::theme;

/// Environment variables coop reads, in display order.
const ENV_VARS: &[&str] = &[
    "COOP_CONFIG_DIR",
    "COOP_DATA_DIR",
    "COOP_CACHE_DIR",
    "COOP_DEFAULT_IMAGE",
    "COOP_FALLBACK_IMAGE",
    "COOP_FALLBACK_FINGERPRINT",
    "COOP_INCUS_SOCKET",
    "COOP_VM_BACKEND",
    "COOP_VM_INSTANCE",
    "COOP_LIMA_INSTANCE",
    "COOP_THEME",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "XDG_CACHE_HOME",
    "XDG_STATE_HOME",
    "RUST_LOG",
];

pub fn init(app: &App) -> Result<()> {
    let t = theme::current();
    app.dirs.ensure().context("Failed to create coop directories")?;
    if app.dirs.settings_path().exists() {
        println!("Settings already exist at {}", app.dirs.settings_path().display());
    } else {
        app.settings.save(&app.dirs)?;
        println!("{} {}", t.ok("✓ Wrote"), app.dirs.settings_path().display());
    }
    let key = SshKeys::new(app.dirs.ssh_dir()).ensure_key()?;
    println!("{} {}", t.ok("✓ SSH key"), key.display());
    println!();
    println!("Next steps:");
    if app.uses_vm() {
        println!("  coop vm start        # start the {} VM", backend_hint(app));
    }
    println!("  coop image build     # build {}", app.settings.default_image());
    println!("  coop create myagent  # create your first sandbox");
    Ok(())
}

fn backend_hint(app: &App) -> String {
    app.backends()
        .map(|m| m.selected().name().to_string())
        .unwrap_or_else(|_| "backend".to_string())
}

pub fn config(app: &App) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&app.settings)?);
    Ok(())
}

pub fn env(app: &App) -> Result<()> {
    let t = theme::current();
    println!("{}", t.accent("Directories"));
    println!("  config:    {}", app.dirs.config.display());
    println!("  data:      {}", app.dirs.data.display());
    println!("  cache:     {}", app.dirs.cache.display());
    println!("  settings:  {}", app.dirs.settings_path().display());
    println!("  instances: {}", app.dirs.instances_dir().display());
    if let Ok(log_dir) = crate::logger::determine_log_dir() {
        println!("  logs:      {}", log_dir.display());
    }
    println!();
    println!("{}", t.accent("Environment"));
    for var in ENV_VARS {
        match std::env::var(var) {
            Ok(v) if !v.is_empty() => println!("  {}={}", var, v),
            _ => println!("  {}", t.muted(format!("{} (unset)", var))),
        }
    }
    println!();
    println!("{}", t.accent("Host"));
    println!("  platform:  {} {}", app.platform.os, app.platform.arch);
    println!("  uses VM:   {}", app.uses_vm());
    Ok(())
}

pub fn version() {
    println!("coop {}", env!("CARGO_PKG_VERSION"));
}
