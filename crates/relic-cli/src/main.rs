//! # relic CLI
//!
//! Command-line interface for the relic artifact registry.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relic_config::logging::{init_logging, LogLevel};
use relic_config::{log_cli_debug, Config};

mod check;
mod delete;
pub mod registry;
mod upload;

use registry::Registry;

/// relic - versioned artifact registry on a plain filesystem
#[derive(Parser)]
#[command(name = "relic")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Registry root directory
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// More output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a directory as a new version
    Upload(upload::UploadArgs),

    /// Rebuild manifest, link sidecars and symlinks of a version
    Reindex(check::VersionArgs),

    /// Check a version against its manifest without changing it
    Validate(check::VersionArgs),

    /// Delete a version, repairing links that point into it
    Delete(delete::DeleteArgs),

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the global config file location
    Path,
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        // Exit quietly when piped into `head` and friends.
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigDfl,
        );
    }

    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    let config = Config::load().context("Failed to load configuration")?;

    if let Commands::Config { command } = &cli.command {
        return show_config(&config, command);
    }

    let registry = Registry::open(cli.registry.as_deref(), config)?;
    log_cli_debug!("Registry opened", root = registry.root().display().to_string());

    match cli.command {
        Commands::Upload(args) => upload::run(&registry, args),
        Commands::Reindex(args) => check::reindex(&registry, args),
        Commands::Validate(args) => check::validate(&registry, args),
        Commands::Delete(args) => delete::run(&registry, args),
        Commands::Config { .. } => Ok(()),
    }
}

fn show_config(config: &Config, command: &ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(config).context("Failed to render configuration")?);
        }
        ConfigCommands::Path => match Config::global_config_path() {
            Some(path) => println!("{}", path.display()),
            None => println!("(no home directory)"),
        },
    }
    Ok(())
}
