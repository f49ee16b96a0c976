use std::io;

use anyhow::Result;
use clap::Subcommand;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use super::App;
use crate::config::Dirs;
use crate::images::{ImageRegistry, ImageSourceRef};
use crate::sandbox::{Readiness, short_fingerprint};
use crate::theme;

#[derive(Debug, Subcommand)]
pub enum ImageCommand {
    /// Build the default base image from the fallback image
    Build {
        #[arg(short, long)]
        verbose: bool,
    },
    /// List local images
    #[command(visible_alias = "ls")]
    List,
    /// Exit 0 when the alias exists locally, 1 otherwise
    Exists { alias: String },
    /// Publish a container snapshot as an image
    Publish {
        container: String,
        snapshot: String,
        alias: String,
    },
    /// Show which container snapshot an image was published from
    Lineage { alias: String },
    /// Delete an image alias and its lineage record
    #[command(visible_alias = "rm")]
    Delete {
        alias: String,
        /// Also delete the image when no other alias points at it
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "ALIAS")]
    alias: String,
    #[tabled(rename = "FINGERPRINT")]
    fingerprint: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "SOURCE")]
    source: String,
}

/// Returns the process exit code.
pub fn run(app: &App, command: ImageCommand) -> Result<i32> {
    let t = theme::current();
    match command {
        ImageCommand::Build { verbose } => {
            let readiness = Readiness {
                verbose,
                ..Readiness::default()
            };
            let fingerprint = app.sandbox()?.build_image(
                &readiness,
                &mut io::stdout(),
                &mut std::thread::sleep,
            )?;
            println!(
                "{} {} ({})",
                t.ok("✓ Built"),
                app.settings.default_image(),
                short_fingerprint(&fingerprint)
            );
        }
        ImageCommand::List => {
            let manager = app.sandbox()?;
            let registry = manager.images().list()?;
            let images = manager.list_images()?;
            if images.is_empty() {
                println!("No images");
                return Ok(0);
            }
            let rows: Vec<ImageRow> = images
                .into_iter()
                .map(|img| {
                    let aliases: Vec<&str> = img.aliases.iter().map(|a| a.name.as_str()).collect();
                    let source = aliases
                        .iter()
                        .find_map(|a| registry.get(*a))
                        .map(|p| format!("{}/{}", p.source.instance, p.source.snapshot))
                        .unwrap_or_else(|| "-".to_string());
                    ImageRow {
                        alias: if aliases.is_empty() {
                            "-".to_string()
                        } else {
                            aliases.join(", ")
                        },
                        fingerprint: short_fingerprint(&img.fingerprint).to_string(),
                        size: format!("{:.1} MiB", img.size as f64 / (1024.0 * 1024.0)),
                        source,
                    }
                })
                .collect();
            let mut table = Table::new(rows);
            table
                .with(Style::blank())
                .modify(Columns::new(0..4), Padding::new(0, 1, 0, 0));
            println!("{table}");
        }
        ImageCommand::Exists { alias } => {
            let exists = app.sandbox()?.image_exists(&alias)?;
            println!("{}", if exists { "yes" } else { "no" });
            return Ok(if exists { 0 } else { 1 });
        }
        ImageCommand::Publish {
            container,
            snapshot,
            alias,
        } => {
            let fingerprint = app.sandbox()?.publish(&container, &snapshot, &alias)?;
            println!(
                "{} {} ({}) from {}/{}",
                t.ok("✓ Published"),
                alias,
                short_fingerprint(&fingerprint),
                container,
                snapshot
            );
        }
        ImageCommand::Lineage { alias } => match recorded_lineage(&app.dirs, &alias)? {
            Some(source) => {
                println!("Built from {}", source.instance);
                println!("Snapshot {}", source.snapshot);
            }
            None => {
                println!("{}", t.muted(format!("No lineage recorded for '{}'", alias)));
                return Ok(1);
            }
        },
        ImageCommand::Delete { alias, purge } => {
            app.sandbox()?.remove_image(&alias, purge)?;
            println!("{} {}", t.ok("✓ Deleted image"), alias);
        }
    }
    Ok(0)
}

/// Lineage is answered from the local registry alone, so the VM and the
/// daemon are left untouched.
fn recorded_lineage(dirs: &Dirs, alias: &str) -> Result<Option<ImageSourceRef>> {
    Ok(ImageRegistry::load(&dirs.image_registry_path())?.get_source(alias)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_reads_the_registry_without_a_daemon() {
        let dir = tempfile::TempDir::new().unwrap();
        let dirs = Dirs::rooted(dir.path());
        assert!(recorded_lineage(&dirs, "my-variant").unwrap().is_none());

        ImageRegistry::load(&dirs.image_registry_path())
            .unwrap()
            .record_publish("my-variant", "abc123", "dev", "s1")
            .unwrap();
        let source = recorded_lineage(&dirs, "my-variant").unwrap().unwrap();
        assert_eq!(source.instance, "dev");
        assert_eq!(source.snapshot, "s1");
    }
}
