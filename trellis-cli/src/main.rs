//! Trellis CLI
//!
//! Command-line interface for submitting and watching Slurm jobs and
//! inspecting GPU hosts, over ssh or on the local machine.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Slurm GPU cluster CLI", long_about = None)]
struct Cli {
    /// Host to run commands on, as [user@]host[:port]
    #[arg(long, env = "TRELLIS_HOST")]
    host: Option<String>,

    /// Login user when the host does not name one
    #[arg(long, env = "TRELLIS_USER")]
    user: Option<String>,

    /// ssh port when the host does not name one
    #[arg(long, env = "TRELLIS_PORT")]
    port: Option<u16>,

    /// Private key for ssh and scp
    #[arg(long, env = "TRELLIS_SSH_KEY")]
    key: Option<PathBuf>,

    /// Run commands on this machine instead of over ssh
    #[arg(long)]
    local: bool,

    /// Log every command sent to the host
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "trellis_client=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let config = Config::resolve(
        cli.host.as_deref(),
        cli.user.as_deref(),
        cli.port,
        cli.key,
        cli.local,
    )?;

    handle_command(cli.command, &config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_local_mode() {
        let cli = Cli::try_parse_from(["trellis", "--local", "host", "gpus"]).unwrap();
        assert!(cli.local);
        assert!(matches!(cli.command, Commands::Host { .. }));
    }

    #[test]
    fn test_poll_arguments() {
        let cli = Cli::try_parse_from([
            "trellis", "--host", "amd@head", "job", "poll", "42", "--interval", "5",
        ])
        .unwrap();
        assert_eq!(cli.host.as_deref(), Some("amd@head"));
        assert!(matches!(cli.command, Commands::Job { .. }));
    }

    #[test]
    fn test_poll_needs_at_least_one_attempt() {
        for args in [
            ["trellis", "--local", "job", "poll", "42", "--attempts", "0"],
            ["trellis", "--local", "job", "poll", "42", "--interval", "0"],
        ] {
            assert!(Cli::try_parse_from(args).is_err());
        }
        assert!(
            Cli::try_parse_from(["trellis", "--local", "job", "poll", "42", "--attempts", "1"])
                .is_ok()
        );
    }
}
