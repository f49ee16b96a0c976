use anyhow::Result;
use clap::Subcommand;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use super::App;
use crate::sandbox::MountRequest;
use crate::theme;

#[derive(Debug, Subcommand)]
pub enum MountCommand {
    /// Mount a host directory into a container
    Add {
        container: String,
        /// Host path (`~` is expanded)
        source: String,
        /// Mount point inside the container (default: /home/agent/<basename>)
        #[arg(long)]
        path: Option<String>,
        /// Device name (default: basename of the source)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        readonly: bool,
        /// Allow guarded paths after entering the seatbelt code
        #[arg(long)]
        force: bool,
    },
    /// Remove a mount
    #[command(visible_alias = "remove")]
    Rm { container: String, name: String },
    /// List mounts
    #[command(visible_alias = "list")]
    Ls { container: String },
}

pub fn run(app: &App, command: MountCommand) -> Result<()> {
    match command {
        MountCommand::Add {
            container,
            source,
            path,
            name,
            readonly,
            force,
        } => {
            let base = default_device_name(&source);
            let req = MountRequest {
                name: name.unwrap_or_else(|| base.clone()),
                path: path.unwrap_or_else(|| format!("/home/agent/{}", base)),
                source,
                readonly,
                force,
            };
            let info = app.sandbox()?.mount(&container, &req)?;
            println!(
                "{} {} -> {}:{}",
                theme::current().ok("✓ Mounted"),
                info.source,
                container,
                info.path
            );
            Ok(())
        }
        MountCommand::Rm { container, name } => {
            app.sandbox()?.unmount(&container, &name)?;
            println!("{} {} from {}", theme::current().ok("✓ Unmounted"), name, container);
            Ok(())
        }
        MountCommand::Ls { container } => list(app, &container),
    }
}

#[derive(Tabled)]
struct MountRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "SOURCE")]
    source: String,
    #[tabled(rename = "PATH")]
    path: String,
    #[tabled(rename = "MODE")]
    mode: String,
}

fn list(app: &App, container: &str) -> Result<()> {
    let mounts = app.sandbox()?.mounts(container)?;
    if mounts.is_empty() {
        println!("No mounts");
        return Ok(());
    }
    let rows: Vec<MountRow> = mounts
        .into_iter()
        .map(|m| MountRow {
            name: m.name,
            source: m.source,
            path: m.path,
            mode: if m.readonly { "ro" } else { "rw" }.to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..4), Padding::new(0, 1, 0, 0));
    println!("{table}");
    Ok(())
}

/// Device name derived from the last path component, reduced to the
/// characters Incus accepts.
fn default_device_name(source: &str) -> String {
    let base = source
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim_start_matches('.');
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    match cleaned.trim_matches('-') {
        "" | "root" => "mount".to_string(),
        s => s.to_string(),
    }
}
