use anyhow::{Result, anyhow};
use clap::Subcommand;

use super::App;
use crate::theme;

#[derive(Debug, Subcommand)]
pub enum StateCommand {
    /// Show the change history of a container
    History {
        container: String,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Print the tracked state of a container
    Show {
        container: String,
        #[arg(long)]
        json: bool,
    },
    /// Reset tracked state to an earlier history entry
    Undo { container: String, hash: String },
    /// Record (and apply, when running) an environment variable
    Env {
        container: String,
        /// KEY=VALUE
        assignment: String,
    },
}

pub fn run(app: &App, command: StateCommand) -> Result<()> {
    let t = theme::current();
    match command {
        StateCommand::History { container, limit } => {
            let tracker = app.tracker(&container)?;
            let head = tracker.head()?;
            let links = tracker.links()?;
            for entry in tracker.history(limit)? {
                let short = &entry.hash[..entry.hash.len().min(12)];
                let mut tags = Vec::new();
                if head.as_deref() == Some(entry.hash.as_str()) {
                    tags.push("HEAD".to_string());
                }
                tags.extend(
                    links
                        .iter()
                        .filter(|(_, h)| **h == entry.hash)
                        .map(|(name, _)| format!("snapshot:{}", name)),
                );
                let tags = if tags.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", tags.join(", "))
                };
                println!(
                    "{}{} {} {}",
                    t.accent(short),
                    t.warn(tags),
                    t.muted(entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
                    entry.message
                );
            }
        }
        StateCommand::Show { container, json } => {
            let record = app.tracker(&container)?.state()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
                return Ok(());
            }
            println!("{}", t.accent(&record.name));
            println!("  Base image: {}", or_dash(&record.base_image));
            println!(
                "  Snapshot:   {}",
                record.current_snapshot.as_deref().unwrap_or("-")
            );
            println!("  Updated:    {}", record.updated_at.format("%Y-%m-%d %H:%M:%S"));
            for (manager, packages) in &record.packages {
                println!("  {:<11} {}", format!("{}:", manager), packages.join(" "));
            }
            for m in &record.mounts {
                let ro = if m.readonly { " (ro)" } else { "" };
                println!("  mount:      {} {} -> {}{}", m.name, m.source, m.path, ro);
            }
            for (k, v) in &record.env {
                println!("  env:        {}={}", k, v);
            }
        }
        StateCommand::Undo { container, hash } => {
            let (record, snapshot) = app.tracker(&container)?.undo(&hash)?;
            println!("{} {} to {}", t.ok("✓ Reset"), record.name, hash);
            if let Some(snap) = snapshot {
                println!(
                    "  {}",
                    t.muted(format!(
                        "This entry matches snapshot '{snap}'; run `coop snapshot restore {container} {snap}` to roll back the filesystem too"
                    ))
                );
            }
        }
        StateCommand::Env {
            container,
            assignment,
        } => {
            let (key, value) = assignment
                .split_once('=')
                .ok_or_else(|| anyhow!("Expected KEY=VALUE, got '{}'", assignment))?;
            let applied = app.sandbox()?.set_env(&container, key, value)?;
            let how = if applied { "set" } else { "recorded" };
            println!("{} {} ({})", t.ok("✓ Env"), key, how);
        }
    }
    Ok(())
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() { "-" } else { s }
}
