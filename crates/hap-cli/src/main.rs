//! hap: push-to-deploy provisioning over ssh and git.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{Command, Selection};

#[derive(Parser)]
#[command(name = "hap")]
#[command(about = "The simple and effective provisioner", long_about = None)]
struct Cli {
    /// Path to the Hapfile
    #[arg(short = 'f', long, env = "HAP_FILE", default_value = "Hapfile", global = true)]
    file: PathBuf,

    /// Hosts to use, as a name or glob. Without it the default or only host is used
    #[arg(short = 'H', long, env = "HAP_HOST", global = true)]
    host: Option<String>,

    /// Use all the hosts
    #[arg(long, global = true, conflicts_with = "host")]
    all: bool,

    /// Log what hap is doing to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a git repo on the remote hosts
    Init,
    /// Push the current checkout and its submodules to the remote hosts
    Push,
    /// Push, then run the builds and commands from the Hapfile
    Build {
        /// Build even if this commit was already built
        #[arg(long)]
        force: bool,
        /// Print the commands without connecting
        #[arg(long)]
        dry: bool,
    },
    /// Push, then run the named deploy from the Hapfile, even if this commit
    /// was already built
    Deploy {
        /// Deploy name
        name: String,
        /// Print the commands without connecting
        #[arg(long)]
        dry: bool,
    },
    /// Push, then execute a script from the repo on the remote hosts
    Exec {
        /// Script path relative to the repo, and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        script: Vec<String>,
    },
    /// Run an arbitrary command on the remote hosts
    C {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Create a new directory with a git repo and a starter Hapfile
    Create {
        /// Directory to create
        name: PathBuf,
    },
    /// Print the resolved hosts, builds and deploys as JSON
    Hosts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let selection = Selection {
        host: cli.host,
        all: cli.all,
    };

    let command = match cli.command {
        Commands::Create { name } => return commands::create::run(&name).await,
        Commands::Hosts => return commands::hosts::run(&cli.file),
        Commands::Init => Command::Init,
        Commands::Push => Command::Push,
        Commands::Build { force, dry } => {
            if dry {
                return commands::build::dry_run(&cli.file, &selection, None, force);
            }
            Command::Build { force }
        }
        Commands::Deploy { name, dry } => {
            if dry {
                return commands::build::dry_run(&cli.file, &selection, Some(&name), true);
            }
            Command::Deploy { name }
        }
        Commands::Exec { script } => Command::Exec {
            script: script.join(" "),
        },
        Commands::C { command } => Command::Arbitrary {
            command: command.join(" "),
        },
    };

    commands::run_remote(&cli.file, &selection, command).await
}
