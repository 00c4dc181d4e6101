//! Command line interface for `plenumd`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::config;

#[derive(Debug, Parser)]
#[command(name = "plenumd", about = "Realtime autoupdate service", version)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file path.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the service.
    Run,
    /// Print the effective config as TOML.
    Config,
}

pub fn main() -> ExitCode {
    let cli = Cli::parse();
    crate::telemetry::init(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("plenum.toml"));
    let config = config::load_or_init(&config_path);

    match cli.command {
        Command::Run => match crate::run::run_service(config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!("service failed: {err}");
                ExitCode::FAILURE
            }
        },
        Command::Config => match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                print!("{rendered}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                tracing::error!("rendering config: {err}");
                ExitCode::FAILURE
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_flags() {
        let cli = Cli::parse_from(["plenumd", "-vv", "--config", "/etc/plenum.toml", "run"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/etc/plenum.toml")));
        assert!(matches!(cli.command, Command::Run));
    }
}
