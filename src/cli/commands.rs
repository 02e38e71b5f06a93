//! CLI command implementations
//!
//! Each command loads the manifest, builds a [`StorageCatalog`], runs one
//! operation and prints one JSON line. Maintenance commands need the target
//! storage closed, which holds for a fresh process unless another one is
//! working on the same root.

use std::path::Path;

use serde_json::{json, Value};

use crate::catalog::StorageCatalog;
use crate::config::DeploymentConfig;
use crate::id::StorageId;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the command. Failures are printed as a
/// JSON error line before they are returned.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    match run_command(&cli.config, cli.command) {
        Ok(data) => write_response(data),
        Err(e) => {
            write_error(e.code_str(), e.message())?;
            Err(e)
        }
    }
}

/// Run one command against the manifest at `config_path`.
pub fn run_command(config_path: &Path, cmd: Command) -> CliResult<Value> {
    let catalog = load_catalog(config_path)?;

    match cmd {
        Command::Update => {
            catalog.update_persistency()?;
            Ok(json!({"updated": true}))
        }
        Command::ResetAll => {
            catalog.reset_persistency()?;
            Ok(json!({"reset": true}))
        }
        Command::RecoverKvs { id } => {
            catalog.recover_key_value_storage(&parse_id(&id)?)?;
            Ok(json!({"recovered": id}))
        }
        Command::ResetKvs { id } => {
            catalog.reset_key_value_storage(&parse_id(&id)?)?;
            Ok(json!({"reset": id}))
        }
        Command::RecoverFiles { id } => {
            catalog.recover_all_files(&parse_id(&id)?)?;
            Ok(json!({"recovered": id}))
        }
        Command::ResetFiles { id } => {
            catalog.reset_all_files(&parse_id(&id)?)?;
            Ok(json!({"reset": id}))
        }
        Command::Size { id } => size(&catalog, &id),
        Command::Keys { id } => {
            let kvs = catalog.open_key_value_storage(&parse_id(&id)?)?;
            Ok(json!({"storage": id, "keys": kvs.get_all_keys()?}))
        }
        Command::Files { id } => {
            let files = catalog.open_file_storage(&parse_id(&id)?)?;
            Ok(json!({"storage": id, "files": files.get_all_file_names()?}))
        }
    }
}

fn load_catalog(config_path: &Path) -> CliResult<StorageCatalog> {
    let config = DeploymentConfig::load(config_path)?;
    Ok(StorageCatalog::new(config)?)
}

fn parse_id(raw: &str) -> CliResult<StorageId> {
    StorageId::parse(raw).map_err(|e| CliError::invalid_argument(e.to_string()))
}

/// Size of whichever kind of storage `raw` names.
fn size(catalog: &StorageCatalog, raw: &str) -> CliResult<Value> {
    let id = parse_id(raw)?;
    let bytes = if catalog.config().find_kvs(&id).is_some() {
        catalog.get_current_key_value_storage_size(&id)?
    } else {
        catalog.get_current_file_storage_size(&id)?
    };
    Ok(json!({"storage": raw, "bytes": bytes}))
}
