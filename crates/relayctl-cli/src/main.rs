//! relayctl — provision, diagnose, and tear down a private IPFS relay.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use relayctl_core::plan::RemovalScope;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_codes;

/// relayctl — IPFS relay reconciler.
#[derive(Parser, Debug)]
#[command(name = "relayctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a relayctl configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Converge the host to a running, proxied relay node.
    Install {
        /// Advertised address for the virtual host (default: primary
        /// routed IPv4).
        #[arg(long)]
        target_ip: Option<String>,

        /// Basic-auth account name.
        #[arg(long)]
        user: Option<String>,

        /// Basic-auth password; generated (and printed once) when omitted.
        #[arg(long)]
        password: Option<String>,

        /// Pre-shared swarm key file to import instead of generating one.
        #[arg(long)]
        swarm_key: Option<PathBuf>,

        /// Kubo version to install.
        #[arg(long)]
        kubo_version: Option<String>,

        /// Print the action plan without applying it.
        #[arg(long)]
        dry_run: bool,
    },

    /// Tear the relay down.
    Remove {
        /// Also remove repository data, the swarm key, credentials, and
        /// the TLS pair.
        #[arg(long)]
        purge: bool,

        /// Removal blast radius.
        #[arg(long, value_enum, default_value_t = ScopeArg::Tracked)]
        scope: ScopeArg,
    },

    /// Read-only health report; never mutates the host.
    Diagnose {
        /// Emit the report as JSON.
        #[arg(long)]
        json: bool,

        /// Include raw tool output in the report.
        #[arg(short, long)]
        verbose: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    /// Exactly the artifacts relayctl provisions.
    Tracked,
    /// Tracked set plus a narrow sweep of well-known residue locations.
    Comprehensive,
}

impl From<ScopeArg> for RemovalScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Tracked => Self::Tracked,
            ScopeArg::Comprehensive => Self::Comprehensive,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_codes::for_error(&err))
        },
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Install {
            target_ip,
            user,
            password,
            swarm_key,
            kubo_version,
            dry_run,
        } => commands::install::run(
            &config,
            commands::install::Args {
                target_ip,
                user,
                password,
                swarm_key,
                kubo_version,
                dry_run,
            },
        ),
        Commands::Remove { purge, scope } => {
            commands::remove::run(&config, scope.into(), purge)
        },
        Commands::Diagnose { json, verbose } => {
            commands::diagnose::run(&config, json, verbose)
        },
    }
}
