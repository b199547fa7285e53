use std::{net::SocketAddr, path::PathBuf, sync::OnceLock};

use clap::{Parser, Subcommand};

/// Per-branch container deployments on stable ports.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "berth.toml")]
    pub config: PathBuf,
    /// Path to the pid file.
    #[arg(long, default_value = "berth.pid")]
    pub pid_file: PathBuf,
    /// Override the listen address from the config file.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the deployment daemon (the default).
    Serve,
    /// Build a docker image and optionally push it to the configured registry.
    Build {
        /// Build context directory.
        #[arg(default_value = ".")]
        context: PathBuf,
        /// Path to the Dockerfile, relative to the context.
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Tag for the built image.
        #[arg(short, long)]
        tag: Option<String>,
    },
    /// Stop a running daemon via its pid file.
    Stop,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
