use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use locker_types::{ActionKind, Coordinates};

mod commands;
mod config;
mod location;

use commands::{ActionArgs, cmd_action, cmd_read, cmd_scan};
use config::Config;

#[derive(Parser)]
#[command(name = "locker")]
#[command(author, version, about = "CLI for smart-locker BLE handshakes", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (default: <config dir>/locker/config.toml)
    #[arg(short, long, global = true, env = "LOCKER_CONFIG")]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Locker and credentials for an unlock command.
#[derive(clap::Args)]
struct UnlockArgs {
    /// Locker id
    locker: String,

    /// Authorization token
    #[arg(short, long, env = "LOCKER_TOKEN", hide_env_values = true)]
    token: String,

    /// Latitude reported to the network fallback
    #[arg(long, requires = "lng", allow_hyphen_values = true)]
    lat: Option<f64>,

    /// Longitude reported to the network fallback
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lng: Option<f64>,
}

impl UnlockArgs {
    fn into_action_args(self) -> Result<ActionArgs> {
        let location = match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => {
                Some(Coordinates::new(lat, lng).context("Invalid --lat/--lng")?)
            }
            _ => None,
        };
        Ok(ActionArgs {
            locker: self.locker,
            token: self.token,
            location,
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby lockers
    Scan {
        /// Scan timeout in seconds (default: from config)
        #[arg(short = 'T', long)]
        timeout: Option<u64>,
    },

    /// Read a locker's status payload
    Read {
        /// Locker id
        locker: String,
    },

    /// Deposit into a locker
    Put(UnlockArgs),

    /// Collect from a locker
    Take(UnlockArgs),

    /// Open a locker for maintenance
    Maintenance(UnlockArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // When quiet mode is enabled, suppress info-level logging
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan { timeout } => {
            let mut options = config.btle_options()?;
            if let Some(secs) = timeout {
                options = options.scan_duration(Duration::from_secs(secs));
                options.validate()?;
            }
            cmd_scan(options, cli.json, cli.quiet).await
        }
        Commands::Read { locker } => cmd_read(&locker, &config, cli.json).await,
        Commands::Put(args) => cmd_action(ActionKind::Put, args.into_action_args()?, &config).await,
        Commands::Take(args) => {
            cmd_action(ActionKind::Take, args.into_action_args()?, &config).await
        }
        Commands::Maintenance(args) => {
            cmd_action(
                ActionKind::OpenForMaintenance,
                args.into_action_args()?,
                &config,
            )
            .await
        }
    }
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
    fn test_parse_put_with_location() {
        let cli = Cli::try_parse_from([
            "locker", "put", "locker-001", "--token", "abc", "--lat", "35.6", "--lng", "-120.1",
        ])
        .unwrap();
        let Commands::Put(args) = cli.command else {
            panic!("expected put");
        };
        let args = args.into_action_args().unwrap();
        assert_eq!(args.locker, "locker-001");
        assert_eq!(args.location, Some(Coordinates { lat: 35.6, lng: -120.1 }));
    }

    #[test]
    fn test_lat_requires_lng() {
        let result =
            Cli::try_parse_from(["locker", "take", "locker-001", "--token", "abc", "--lat", "1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_coordinates() {
        let cli = Cli::try_parse_from([
            "locker", "maintenance", "locker-001", "--token", "abc", "--lat", "95", "--lng", "0",
        ])
        .unwrap();
        let Commands::Maintenance(args) = cli.command else {
            panic!("expected maintenance");
        };
        assert!(args.into_action_args().is_err());
    }
}
