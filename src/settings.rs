//! Runtime settings — SPEC_FULL.md §2.3. Layered CLI flags over environment
//! variables over defaults, via `clap` + the `config` crate, mirroring the
//! teacher's `config::Config::builder()` layering in `relayer.rs`'s `main`.

use std::path::PathBuf;

use clap::Parser;
use config::{Config, Environment};
use serde::Deserialize;

use crate::error::Error;

#[derive(Debug, Parser)]
#[command(name = "bunkerd", about = "Remote signing bunker daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Initialize a fresh config file with a new admin identity.
    Setup {
        #[arg(long, default_value = "config/nsecbunker.json")]
        config: PathBuf,
    },
    /// Add a new managed key.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "config/nsecbunker.json")]
        config: PathBuf,
    },
    /// Run the bunker daemon.
    Start(StartArgs),
}

#[derive(Debug, clap::Args)]
pub struct StartArgs {
    #[arg(long, default_value = "config/nsecbunker.json")]
    pub config: PathBuf,

    #[arg(long)]
    pub verbose: bool,

    /// Repeatable: unlock these keys on boot (passphrase read interactively).
    #[arg(long = "key")]
    pub keys: Vec<String>,

    /// Repeatable: additional admin pubkeys beyond the config file's list.
    #[arg(long = "admin", env = "ADMIN_NPUBS", value_delimiter = ',')]
    pub admins: Vec<String>,

    #[arg(long, default_value = "127.0.0.1:4470")]
    pub web_bind: String,
}

/// Settings resolved by merging `StartArgs` with environment-sourced
/// defaults, the way `relayer.rs` layers `config::Config::builder()` over
/// its own CLI struct.
#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: Option<String>,
}

pub fn load(verbose: bool) -> Result<Settings, Error> {
    let builder = Config::builder()
        .set_default("log_level", if verbose { "debug" } else { "info" })
        .map_err(|e| Error::Internal(format!("invalid settings default: {e}")))?
        .add_source(Environment::with_prefix("BUNKERD"));

    builder
        .build()
        .map_err(|e| Error::Internal(format!("failed to build settings: {e}")))?
        .try_deserialize()
        .map_err(|e| Error::Internal(format!("failed to parse settings: {e}")))
}
