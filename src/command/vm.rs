//! VM backend commands.

use std::io::{self, Write};

use anyhow::{Result, bail};
use clap::Subcommand;

use super::App;
use crate::backend::VmState;
use crate::error::Error;
use crate::prompt;
use crate::spinner::with_spinner;
use crate::theme;

#[derive(Debug, Subcommand)]
pub enum VmCommand {
    /// Show the selected backend and its VM
    Status,
    /// Start (or create) the VM
    Start,
    /// Stop the VM
    Stop,
    /// Open a shell inside the VM
    Shell,
    /// Run a command inside the VM and print its output
    Exec {
        /// Command and arguments (after --)
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Delete the VM and everything in it
    Delete {
        #[arg(short, long)]
        yes: bool,
    },
    /// Print the Incus endpoint
    Socket,
    /// List known backends and their availability
    Backends,
}

/// Returns the process exit code.
pub fn run(app: &App, command: VmCommand) -> Result<i32> {
    let t = theme::current();
    if !app.uses_vm() && !matches!(command, VmCommand::Socket | VmCommand::Backends) {
        println!(
            "{}",
            t.muted("Incus runs natively on this host; no VM is involved.")
        );
        return Ok(0);
    }
    match command {
        VmCommand::Status => {
            let manager = app.backends()?;
            let backend = manager.selected();
            let status = backend.status()?;
            println!("{} {}", t.accent("Backend:"), backend.name());
            println!("  Instance: {}", status.name);
            let state = match status.state {
                VmState::Running => t.ok(status.state.to_string()),
                VmState::Missing => t.muted(status.state.to_string()),
                _ => t.warn(status.state.to_string()),
            };
            println!("  State:    {}", state);
            if status.state == VmState::Running {
                println!("  CPUs:     {}", status.cpus);
                println!("  Memory:   {:.1} GiB", status.memory_gib);
                println!("  Disk:     {:.1} GiB", status.disk_gib);
                if !status.arch.is_empty() {
                    println!("  Arch:     {}", status.arch);
                }
                if !status.runtime.is_empty() {
                    println!("  Runtime:  {}", status.runtime);
                }
                if let Ok(endpoint) = backend.incus_endpoint() {
                    println!("  Incus:    {}", endpoint);
                }
            }
        }
        VmCommand::Start => {
            let manager = app.backends()?;
            let backend = manager.selected();
            with_spinner(&format!("Starting {} VM", backend.name()), || backend.start())?;
            manager.register_remote();
        }
        VmCommand::Stop => {
            let manager = app.backends()?;
            let backend = manager.selected();
            with_spinner(&format!("Stopping {} VM", backend.name()), || backend.stop())?;
        }
        VmCommand::Shell => {
            let manager = app.backends()?;
            return Ok(manager.selected().shell()?);
        }
        VmCommand::Exec { command } => {
            let manager = app.backends()?;
            let argv: Vec<&str> = command.iter().map(String::as_str).collect();
            let output = manager.selected().exec(&argv)?;
            io::stdout().write_all(&output)?;
        }
        VmCommand::Delete { yes } => {
            let manager = app.backends()?;
            let backend = manager.selected();
            let status = backend.status()?;
            if !yes
                && prompt::is_interactive()
                && !prompt::confirm(&format!(
                    "Delete VM '{}' and every container inside it?",
                    status.name
                ))?
            {
                bail!(Error::UserCancel("Aborted.".into()));
            }
            backend.delete()?;
            println!("{} {}", t.ok("✓ Deleted VM"), status.name);
        }
        VmCommand::Socket => {
            if app.uses_vm() {
                let manager = app.backends()?;
                println!("{}", manager.selected().incus_endpoint()?);
            } else {
                println!("unix://{}", app.native_socket().display());
            }
        }
        VmCommand::Backends => {
            let manager = match app.backends() {
                Ok(m) => m,
                Err(e) => {
                    println!("{}", t.warn(format!("{:#}", e)));
                    return Ok(1);
                }
            };
            println!("Priority: {}", manager.priority().join(", "));
            for (name, available, selected) in manager.summary() {
                let mark = if selected { "*" } else { " " };
                let avail = if available {
                    t.ok("available")
                } else {
                    t.muted("not installed")
                };
                println!("{} {:<12} {}", mark, name, avail);
            }
        }
    }
    Ok(0)
}
