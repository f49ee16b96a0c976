use anyhow::Result;
use clap::Subcommand;

use super::App;
use crate::guard::{AuthCode, MountGuard};
use crate::theme;

#[derive(Debug, Subcommand)]
pub enum SeatbeltCommand {
    /// Print the current authorization code
    Code,
    /// Replace the seatbelt secret, invalidating any authenticator setup
    Rotate,
    /// Explain whether a path is guarded
    Check { path: String },
}

pub fn run(app: &App, command: SeatbeltCommand) -> Result<i32> {
    let t = theme::current();
    let auth = AuthCode::new(app.dirs.seatbelt_key_path());
    match command {
        SeatbeltCommand::Code => {
            let code = auth.current_code()?;
            println!("{}", t.accent(code));
            println!(
                "{}",
                t.muted(format!("valid for {}s", auth.seconds_remaining()))
            );
        }
        SeatbeltCommand::Rotate => {
            auth.rotate()?;
            auth.current_code()?;
            println!(
                "{} {}",
                t.ok("✓ New secret written to"),
                auth.key_path().display()
            );
        }
        SeatbeltCommand::Check { path } => {
            let guard = MountGuard::for_user(&app.dirs)?;
            if guard.is_hard_blocked(&path)? {
                println!("{} {}", t.error("blocked"), path);
                println!("  the coop configuration directory can never be mounted");
                return Ok(1);
            }
            let verdict = guard.is_seatbelted(&path)?;
            if verdict.seatbelted {
                println!("{} {}", t.warn("guarded"), verdict.resolved.display());
                println!("  {}", verdict.reason);
                println!("  {}", t.muted("mount with --force and enter `coop seatbelt code`"));
                return Ok(1);
            }
            println!("{} {}", t.ok("allowed"), verdict.resolved.display());
        }
    }
    Ok(0)
}
