//! Container lifecycle and access commands.

use std::io::{self, IsTerminal};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use super::App;
use crate::error::Error;
use crate::prompt;
use crate::sandbox::{CreateRequest, Readiness, SandboxManager};
use crate::state::PackageManager;
use crate::theme;
use crate::{cmd::Cmd, names};

#[derive(Debug, clap::Args)]
pub struct CreateArgs {
    /// Container name (generated when omitted)
    pub name: Option<String>,

    /// CPU limit
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Memory limit in MiB
    #[arg(long)]
    pub memory: Option<u64>,

    /// Root disk size in GiB
    #[arg(long)]
    pub disk: Option<u64>,

    /// Public key file authorized for the agent user (defaults to coop's own key)
    #[arg(long = "ssh-key")]
    pub ssh_key: Option<PathBuf>,

    /// Host directory mounted at /workspace
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Stream the cloud-init log while waiting
    #[arg(short, long)]
    pub verbose: bool,
}

pub fn create(app: &App, args: CreateArgs) -> Result<()> {
    let name = args.name.unwrap_or_else(names::generate_name);
    names::validate_container_name(&name)?;
    let manager = app.sandbox()?;

    let ssh_public_key = match &args.ssh_key {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read SSH public key {}", path.display()))?,
        ),
        None => {
            manager.ssh_keys().ensure_key()?;
            manager.ssh_keys().public_key()?
        }
    };

    let defaults = &app.settings.container;
    let req = CreateRequest {
        name: name.clone(),
        cpus: args.cpus.unwrap_or_else(|| defaults.cpus()),
        memory_mb: args.memory.unwrap_or_else(|| defaults.memory_mb()),
        disk_gb: args.disk.unwrap_or_else(|| defaults.disk_gb()),
        ssh_public_key,
        workdir: args.workdir,
        readiness: Readiness {
            verbose: args.verbose,
            ..Readiness::default()
        },
        interactive: true,
    };

    let t = theme::current();
    let mut stdout = io::stdout();
    let created = manager.create(&req, &mut stdout, &mut std::thread::sleep)?;
    println!(
        "{} {} ({})",
        t.ok("✓ Created"),
        t.accent(&created.name),
        created.image
    );
    match &created.ipv4 {
        Some(ip) => {
            println!("  IPv4:  {}", ip);
            println!("  Shell: coop shell {}", created.name);
        }
        None => println!("  {}", t.muted("No IPv4 address yet; try `coop status` later")),
    }
    Ok(())
}

pub fn start(app: &App, name: &str) -> Result<()> {
    app.sandbox()?.start(name)?;
    println!("{} {}", theme::current().ok("✓ Started"), name);
    Ok(())
}

pub fn stop(app: &App, name: &str, force: bool) -> Result<()> {
    app.sandbox()?.stop(name, force)?;
    println!("{} {}", theme::current().ok("✓ Stopped"), name);
    Ok(())
}

pub fn lock(app: &App, name: &str) -> Result<()> {
    app.sandbox()?.freeze(name)?;
    println!("{} {} (frozen)", theme::current().ok("✓ Locked"), name);
    Ok(())
}

pub fn unlock(app: &App, name: &str) -> Result<()> {
    app.sandbox()?.unfreeze(name)?;
    println!("{} {}", theme::current().ok("✓ Unlocked"), name);
    Ok(())
}

pub fn logs(app: &App, name: &str) -> Result<()> {
    print!("{}", app.sandbox()?.logs(name)?);
    Ok(())
}

pub fn delete(app: &App, name: &str, force: bool, yes: bool) -> Result<()> {
    names::validate_container_name(name)?;
    if !yes && prompt::is_interactive() && !prompt::confirm(&format!("Delete container '{}'?", name))? {
        bail!(Error::UserCancel("Aborted.".into()));
    }
    app.sandbox()?.delete(name, force)?;
    println!("{} {}", theme::current().ok("✓ Deleted"), name);
    Ok(())
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "IPV4")]
    ipv4: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

pub fn list(app: &App, json: bool) -> Result<()> {
    let containers = app.sandbox()?.list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&containers)?);
        return Ok(());
    }
    if containers.is_empty() {
        println!("No containers found");
        return Ok(());
    }
    let rows: Vec<ContainerRow> = containers
        .into_iter()
        .map(|c| ContainerRow {
            name: c.name,
            status: c.status,
            ipv4: c.ipv4.unwrap_or_else(|| "-".to_string()),
            created: c.created_at.get(..10).unwrap_or(c.created_at.as_str()).to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..4), Padding::new(0, 1, 0, 0));
    println!("{table}");
    Ok(())
}

pub fn status(app: &App, name: &str, json: bool) -> Result<()> {
    let info = app.sandbox()?.info(name)?;
    if json {
        let value = serde_json::json!({
            "name": info.instance.name,
            "status": info.instance.status,
            "ipv4": info.ipv4,
            "created_at": info.instance.created_at,
            "profiles": info.instance.profiles,
            "limits": {
                "cpu": info.instance.config.get("limits.cpu"),
                "memory": info.instance.config.get("limits.memory"),
            },
            "mounts": info.mounts,
            "state": info.record,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let t = theme::current();
    println!("{}", t.accent(&info.instance.name));
    println!("  Status:   {}", info.instance.status);
    println!("  IPv4:     {}", info.ipv4.as_deref().unwrap_or("-"));
    println!("  Created:  {}", info.instance.created_at);
    if let Some(cpu) = info.instance.config.get("limits.cpu") {
        println!("  CPUs:     {}", cpu);
    }
    if let Some(mem) = info.instance.config.get("limits.memory") {
        println!("  Memory:   {}", mem);
    }
    if let Some(record) = &info.record {
        if !record.base_image.is_empty() {
            println!("  Image:    {}", record.base_image);
        }
        if let Some(snap) = &record.current_snapshot {
            println!("  Snapshot: {}", snap);
        }
    }
    if !info.mounts.is_empty() {
        println!("  Mounts:");
        for m in &info.mounts {
            let ro = if m.readonly { " (ro)" } else { "" };
            println!("    {} {} -> {}{}", m.name, m.source, m.path, ro);
        }
    }
    Ok(())
}

/// `--print` shows the command instead of running it.
pub fn ssh(app: &App, name: &str, print: bool) -> Result<i32> {
    let manager = app.sandbox()?;
    if print || !io::stdout().is_terminal() {
        println!("{}", manager.ssh_command(name)?);
        return Ok(0);
    }
    manager.ssh_keys().ensure_key()?;
    let args = manager.ssh_args(name)?;
    Ok(Cmd::new(&args[0]).args(&args[1..]).run_interactive()?)
}

pub fn shell(app: &App, name: &str) -> Result<i32> {
    Ok(app.sandbox()?.shell(name)?)
}

pub fn exec(app: &App, name: &str, command: &[String]) -> Result<i32> {
    let argv: Vec<&str> = command.iter().map(String::as_str).collect();
    Ok(app.sandbox()?.exec(name, &argv)?)
}

pub fn install(app: &App, name: &str, manager: PackageManager, packages: &[String]) -> Result<()> {
    let sandbox: SandboxManager = app.sandbox()?;
    sandbox
        .install(name, manager, packages)
        .with_context(|| format!("Failed to install {} packages in {}", manager, name))?;
    println!(
        "{} {} ({})",
        theme::current().ok("✓ Installed"),
        packages.join(" "),
        manager
    );
    Ok(())
}
