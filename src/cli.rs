use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "ntpwatch", version, about = "NTP lab container harness and peer-table collector")]
pub struct Cli {
    /// Configuration file (defaults to ./ntpwatch.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Remove any existing container, rebuild the image and start it
    Build,
    /// Resume the stopped container or create a new one
    Start,
    /// Open an interactive shell in the running container
    Enter,
    /// Stop the running container
    Stop,
    /// Append one timestamped peer table to the log
    Collect(CollectArgs),
    /// Collect on the configured interval until interrupted
    Watch(CollectArgs),
    /// Show container state, NTP service health and peers
    Status,
    /// Parse the collected log into JSON and print a per-server summary
    Parse(ParseArgs),
}

#[derive(Args, Debug)]
pub struct CollectArgs {
    /// Query the NTP daemon on this machine instead of the container
    #[arg(long)]
    pub local: bool,

    /// Log file to append to (defaults to the configured log path, which
    /// is refused while the container's own cron job writes to it)
    #[arg(long)]
    pub log: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ParseArgs {
    /// Log file to read (defaults to the configured log path)
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Directory for samples.json and summary.json
    #[arg(long, default_value = "parsed-ntp-logs")]
    pub output: PathBuf,
}
