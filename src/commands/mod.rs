// ABOUTME: Command implementations behind the CLI subcommands
// ABOUTME: Each command loads the engine from the config file and prints a human summary

pub mod conflicts;
pub mod infra;
pub mod run;
pub mod status;

use std::path::Path;

use anyhow::{Context, Result};

use crate::{SyncConfig, SyncEngine};

pub use conflicts::{list_conflicts, resolve_conflict};
pub use infra::{check, compact, setup, tables, teardown, validate};
pub use run::{run, sync, RunOptions};
pub use status::status;

/// Load and validate the configuration, then open the engine and its journal.
pub fn load_engine(config_path: &Path) -> Result<SyncEngine> {
    let config = SyncConfig::load(config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))?;
    tracing::debug!(
        "Loaded {} endpoint(s) and {} pair(s) from {:?}",
        config.endpoints.len(),
        config.pairs.len(),
        config_path
    );
    SyncEngine::new(config).context("Failed to start sync engine")
}

fn banner(title: &str) {
    println!();
    println!("========================================");
    println!("{}", title);
    println!("========================================");
}
