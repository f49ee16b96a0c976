use crate::command::container::CreateArgs;
use crate::command::image::ImageCommand;
use crate::command::mount::MountCommand;
use crate::command::seatbelt::SeatbeltCommand;
use crate::command::snapshot::SnapshotCommand;
use crate::command::state::StateCommand;
use crate::command::theme::ThemeCommand;
use crate::command::vm::VmCommand;
use crate::command::{self, App};
use crate::state::PackageManager;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "coop")]
#[command(about = "Manage Incus containers as sandboxes for AI coding agents")]
#[command(after_help = "Run 'coop doctor' to check your setup.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the coop directories, settings file and SSH key
    Init,

    /// Create and start a new sandbox container
    Create(CreateArgs),

    /// Start a stopped container
    Start { name: String },

    /// Stop a running container
    Stop {
        name: String,

        /// Stop immediately, even when frozen
        #[arg(short, long)]
        force: bool,
    },

    /// Freeze every process in a container
    Lock { name: String },

    /// Resume a frozen container
    Unlock { name: String },

    /// Print the container's cloud-init log
    Logs { name: String },

    /// Delete a container and its tracked state
    #[command(visible_alias = "rm")]
    Delete {
        name: String,

        /// Stop the container first when it is running or frozen
        #[arg(short, long)]
        force: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// List sandbox containers
    #[command(visible_alias = "ls")]
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show details of one container
    Status {
        name: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// SSH into a container as the agent user
    Ssh {
        name: String,

        /// Print the ssh command instead of running it
        #[arg(long)]
        print: bool,
    },

    /// Open a login shell inside a container
    Shell { name: String },

    /// Run a command inside a container
    Exec {
        name: String,

        /// Command and arguments (after --)
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Manage host directory mounts
    Mount {
        #[command(subcommand)]
        command: MountCommand,
    },

    /// Manage container snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },

    /// Inspect and rewind tracked container state
    State {
        #[command(subcommand)]
        command: StateCommand,
    },

    /// Install packages and record them in the container's state
    Install {
        name: String,

        /// Package manager (apt, pip, npm, go, cargo, brew, custom)
        #[arg(value_parser = parse_manager)]
        manager: PackageManager,

        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Build, publish and inspect images
    Image {
        #[command(subcommand)]
        command: ImageCommand,
    },

    /// Manage the VM hosting Incus (macOS and forced backends)
    Vm {
        #[command(subcommand)]
        command: VmCommand,
    },

    /// Print the effective settings
    Config,

    /// Show directories, environment overrides and host details
    Env,

    /// Preview and list color themes
    Theme {
        #[command(subcommand)]
        command: ThemeCommand,
    },

    /// Mount-guard authorization codes
    Seatbelt {
        #[command(subcommand)]
        command: SeatbeltCommand,
    },

    /// Check the local setup and the Incus connection
    Doctor {
        /// Create missing directories and keys and tighten permissions
        #[arg(long)]
        fix: bool,
    },

    /// Print the version
    Version,

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn parse_manager(s: &str) -> Result<PackageManager, String> {
    s.parse().map_err(|e: crate::error::Error| e.to_string())
}

// --- Public Entry Point ---
/// Parses arguments and runs the command, returning the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();

    // These never touch settings or Incus.
    match &cli.command {
        Commands::Version => {
            command::setup::version();
            return Ok(0);
        }
        Commands::Completions { shell } => {
            generate_completions(*shell);
            return Ok(0);
        }
        _ => {}
    }

    let app = App::load()?;
    let done = |r: Result<()>| r.map(|()| 0);

    match cli.command {
        Commands::Init => done(command::setup::init(&app)),
        Commands::Create(args) => done(command::container::create(&app, args)),
        Commands::Start { name } => done(command::container::start(&app, &name)),
        Commands::Stop { name, force } => done(command::container::stop(&app, &name, force)),
        Commands::Lock { name } => done(command::container::lock(&app, &name)),
        Commands::Unlock { name } => done(command::container::unlock(&app, &name)),
        Commands::Logs { name } => done(command::container::logs(&app, &name)),
        Commands::Delete { name, force, yes } => {
            done(command::container::delete(&app, &name, force, yes))
        }
        Commands::List { json } => done(command::container::list(&app, json)),
        Commands::Status { name, json } => done(command::container::status(&app, &name, json)),
        Commands::Ssh { name, print } => command::container::ssh(&app, &name, print),
        Commands::Shell { name } => command::container::shell(&app, &name),
        Commands::Exec { name, command } => command::container::exec(&app, &name, &command),
        Commands::Mount { command } => done(command::mount::run(&app, command)),
        Commands::Snapshot { command } => done(command::snapshot::run(&app, command)),
        Commands::State { command } => done(command::state::run(&app, command)),
        Commands::Install {
            name,
            manager,
            packages,
        } => done(command::container::install(&app, &name, manager, &packages)),
        Commands::Image { command } => command::image::run(&app, command),
        Commands::Vm { command } => command::vm::run(&app, command),
        Commands::Config => done(command::setup::config(&app)),
        Commands::Env => done(command::setup::env(&app)),
        Commands::Theme { command } => done(command::theme::run(command)),
        Commands::Seatbelt { command } => command::seatbelt::run(&app, command),
        Commands::Doctor { fix } => command::doctor::run(&app, fix),
        Commands::Version | Commands::Completions { .. } => Ok(0),
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, &name, &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exec_takes_trailing_command() {
        let cli = Cli::try_parse_from(["coop", "exec", "box", "--", "ls", "-la"]).unwrap();
        match cli.command {
            Commands::Exec { name, command } => {
                assert_eq!(name, "box");
                assert_eq!(command, vec!["ls", "-la"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn install_parses_manager() {
        let cli =
            Cli::try_parse_from(["coop", "install", "box", "pip", "requests", "rich"]).unwrap();
        match cli.command {
            Commands::Install {
                manager, packages, ..
            } => {
                assert_eq!(manager, PackageManager::Pip);
                assert_eq!(packages, vec!["requests", "rich"]);
            }
            _ => panic!("expected install"),
        }
        assert!(Cli::try_parse_from(["coop", "install", "box", "yum", "jq"]).is_err());
        assert!(Cli::try_parse_from(["coop", "install", "box", "apt"]).is_err());
    }

    #[test]
    fn list_has_ls_alias() {
        let cli = Cli::try_parse_from(["coop", "ls", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::List { json: true }));
    }
}
