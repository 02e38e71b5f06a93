//! CLI argument definitions using clap
//!
//! Commands:
//! - perctl --config <path> update
//! - perctl --config <path> reset-all
//! - perctl --config <path> recover-kvs <id>
//! - perctl --config <path> size <id>
//! - ...

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// perctl - maintenance tool for redundant persistency storages
#[derive(Parser, Debug)]
#[command(name = "perctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the deployment manifest
    #[arg(long, global = true, default_value = "./persistency.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install missing storages and defaults, run pending migrations
    Update,

    /// Remove the content of every configured storage
    ResetAll,

    /// Repair a Key-Value Storage from its redundant copies
    RecoverKvs { id: String },

    /// Reset a Key-Value Storage to its deployment defaults
    ResetKvs { id: String },

    /// Repair every file of a File Storage
    RecoverFiles { id: String },

    /// Reset a File Storage to its deployment files
    ResetFiles { id: String },

    /// Physical size of a storage in bytes
    Size { id: String },

    /// List the keys of a Key-Value Storage
    Keys { id: String },

    /// List the files of a File Storage
    Files { id: String },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommand_with_id() {
        let cli = Cli::try_parse_from(["perctl", "--config", "m.json", "recover-kvs", "app/settings"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("m.json"));
        match cli.command {
            Command::RecoverKvs { id } => assert_eq!(id, "app/settings"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_default_config_path() {
        let cli = Cli::try_parse_from(["perctl", "update"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("./persistency.json"));
        assert!(matches!(cli.command, Command::Update));
    }
}
