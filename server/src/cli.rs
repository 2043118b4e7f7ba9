//! # CLI Interface
//!
//! Command-line arguments for `roster-server`, via `clap` derive. Every
//! option can also come from a `ROSTER_*` environment variable.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use roster_integrity::config::{DEFAULT_API_PORT, DEFAULT_METRICS_PORT};

use crate::logging::LogFormat;

/// Signed user roster server.
///
/// Serves the admin API, signs every user email with the deployment's
/// P-384 key, and exports the roster as protobuf for independent
/// verification.
#[derive(Parser, Debug)]
#[command(
    name = "roster-server",
    about = "Signed user roster server",
    version,
    propagate_version = true
)]
pub struct RosterCli {
    /// Log output format.
    #[arg(long, global = true, env = "ROSTER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the API and metrics servers.
    Run(RunArgs),
    /// Create the data directory and keypair, then print the public key.
    Init(InitArgs),
    /// Fetch a running server's export, verify every record, and print the
    /// trusted ones.
    Verify(VerifyArgs),
    /// Print version information and exit.
    Version,
}

/// Location of keys and the user database.
#[derive(Args, Debug, Clone)]
pub struct DataDirArg {
    /// Directory holding `keys/` and `db/`. Created if missing.
    #[arg(long, short = 'd', env = "ROSTER_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub data: DataDirArg,

    /// Port for the admin API.
    #[arg(long, short = 'p', env = "ROSTER_PORT", default_value_t = DEFAULT_API_PORT)]
    pub port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "ROSTER_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Address to bind both listeners on.
    #[arg(long, env = "ROSTER_BIND", default_value = "0.0.0.0")]
    pub bind: String,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    #[command(flatten)]
    pub data: DataDirArg,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Base URL of a running roster server.
    #[arg(long, env = "ROSTER_API_URL", default_value = "http://127.0.0.1:3000")]
    pub api_url: String,

    /// Print the trusted records as JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}
