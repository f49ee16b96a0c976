use anyhow::Result;
use clap::Subcommand;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use super::App;
use crate::theme;

#[derive(Debug, Subcommand)]
pub enum SnapshotCommand {
    /// Snapshot a container (stopped briefly if running)
    Create {
        container: String,
        name: String,
        /// Note recorded in the state history
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Roll a container back to a snapshot
    Restore { container: String, name: String },
    /// List snapshots
    #[command(visible_alias = "ls")]
    List { container: String },
    /// Delete a snapshot
    #[command(visible_alias = "rm")]
    Delete { container: String, name: String },
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "CREATED")]
    created: String,
    #[tabled(rename = "TRACKED")]
    tracked: String,
}

pub fn run(app: &App, command: SnapshotCommand) -> Result<()> {
    let t = theme::current();
    match command {
        SnapshotCommand::Create {
            container,
            name,
            note,
        } => {
            app.sandbox()?.snapshot(&container, &name, &note)?;
            println!("{} {}/{}", t.ok("✓ Snapshot created"), container, name);
        }
        SnapshotCommand::Restore { container, name } => {
            let record = app.sandbox()?.restore(&container, &name)?;
            println!("{} {} to {}", t.ok("✓ Restored"), container, name);
            if record.is_none() {
                println!(
                    "  {}",
                    t.muted("Snapshot predates state tracking; tracked state left unchanged")
                );
            }
        }
        SnapshotCommand::List { container } => {
            let snapshots = app.sandbox()?.list_snapshots(&container)?;
            if snapshots.is_empty() {
                println!("No snapshots");
                return Ok(());
            }
            let links = app.tracker(&container)?.links()?;
            let rows: Vec<SnapshotRow> = snapshots
                .into_iter()
                .map(|s| SnapshotRow {
                    tracked: links
                        .get(&s.name)
                        .map(|h| h[..h.len().min(12)].to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    name: s.name,
                    created: s.created_at,
                })
                .collect();
            let mut table = Table::new(rows);
            table
                .with(Style::blank())
                .modify(Columns::new(0..3), Padding::new(0, 1, 0, 0));
            println!("{table}");
        }
        SnapshotCommand::Delete { container, name } => {
            app.sandbox()?.delete_snapshot(&container, &name)?;
            println!("{} {}/{}", t.ok("✓ Deleted snapshot"), container, name);
        }
    }
    Ok(())
}
