use anyhow::{Result, anyhow};
use clap::Subcommand;

use crate::theme::{self, THEMES, Theme};

#[derive(Debug, Subcommand)]
pub enum ThemeCommand {
    /// Render sample output in a theme (default: the active one)
    Preview { name: Option<String> },
    /// List available themes
    List,
}

pub fn run(command: ThemeCommand) -> Result<()> {
    match command {
        ThemeCommand::List => {
            let active = theme::current().name;
            for t in THEMES {
                let mark = if t.name == active { "*" } else { " " };
                println!("{} {:<8} {}", mark, t.name, t.muted(t.description));
            }
        }
        ThemeCommand::Preview { name } => {
            let t = match name {
                Some(n) => theme::find(&n).ok_or_else(|| {
                    let names: Vec<_> = THEMES.iter().map(|t| t.name).collect();
                    anyhow!("Unknown theme '{}' (available: {})", n, names.join(", "))
                })?,
                None => theme::current(),
            };
            preview(&t);
        }
    }
    Ok(())
}

fn preview(t: &Theme) {
    println!("{}", t.accent(format!("Theme: {}", t.name)));
    println!("{} myagent (coop-agent-base)", t.ok("✓ Created"));
    println!("  cloud-init: {}", t.warn("running"));
    println!("{} refusing to mount ~/.ssh: contains SSH keys", t.error("Error:"));
    println!("{}", t.muted("VM 'coop' was not started."));
}
