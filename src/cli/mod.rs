//! CLI module for perctl
//!
//! Maintenance front end over a [`StorageCatalog`](crate::catalog::StorageCatalog):
//! - update: install missing storages and defaults, migrate
//! - reset-all / reset-kvs / reset-files: back to deployment defaults
//! - recover-kvs / recover-files: repair from redundant copies
//! - size / keys / files: inspection

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
