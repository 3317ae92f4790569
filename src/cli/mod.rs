//! CLI module for offload
//!
//! Subcommands:
//! - `offload worker` - Run a worker server with the built-in compute functions
//! - `offload run` - Offload one computation to a profile and print the result
//! - `offload profiles` - Manage connection profiles

use clap::builder::RangedU64ValueParser;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

use crate::config::{DEFAULT_LOCAL_WORKERS, DEFAULT_WORKER_PORT};

#[derive(Parser, Debug)]
#[command(name = "offload")]
#[command(about = "Offload pipeline computations to remote worker pools")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to the profiles file (default: ~/.offload/profiles)
    #[arg(long, value_name = "FILE", global = true)]
    pub profiles: Option<String>,

    /// Path to a .env file, loaded before arguments that read the environment
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a worker server
    Worker(WorkerArgs),

    /// Offload one computation and wait for its result
    Run(RunArgs),

    /// Manage connection profiles
    Profiles(ProfilesArgs),
}

/// Arguments for the worker command
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Bind address for the server
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_WORKER_PORT)]
    pub port: u16,

    /// Number of computations run concurrently
    #[arg(short, long, default_value_t = DEFAULT_LOCAL_WORKERS, value_parser = worker_count())]
    pub workers: usize,

    /// Require this bearer token on compute requests
    #[arg(long, env = "OFFLOAD_API_KEY")]
    pub api_key: Option<String>,
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Name of the compute function to run
    #[arg(long)]
    pub compute: String,

    /// Profile to run on (default: the profiles file's default-profile)
    #[arg(long)]
    pub profile: Option<String>,

    /// Input port value as port=json; repeat a port to build a list
    #[arg(short, long = "input", value_name = "PORT=JSON")]
    pub inputs: Vec<String>,

    /// Append the execution record to this JSON lines file
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

/// Arguments for the profiles command
#[derive(Parser, Debug)]
pub struct ProfilesArgs {
    #[command(subcommand)]
    pub action: Option<ProfilesAction>,
}

#[derive(Subcommand, Debug)]
pub enum ProfilesAction {
    /// List all profiles
    List,

    /// Make a profile the default
    Use {
        /// Profile name
        name: String,
    },

    /// Add an in-process pool profile
    AddLocal {
        /// Profile name
        name: String,

        /// Number of workers
        #[arg(long, default_value_t = DEFAULT_LOCAL_WORKERS, value_parser = worker_count())]
        workers: usize,
    },

    /// Add a profile reaching worker servers over HTTP
    AddHttp {
        /// Profile name
        name: String,

        /// Worker server URL (repeatable)
        #[arg(long = "url", required = true)]
        urls: Vec<String>,

        /// API key for authentication
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Delete a profile
    Delete {
        /// Profile name
        name: String,
    },
}

fn worker_count() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::new().range(1..)
}

/// Find `--env-file` in raw arguments so the file can be loaded before clap
/// reads `env` defaults such as `OFFLOAD_API_KEY`
pub fn env_file_arg<S: AsRef<str>>(args: &[S]) -> Option<PathBuf> {
    let mut iter = args.iter().skip(1).map(AsRef::as_ref);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            return iter.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--env-file=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}
