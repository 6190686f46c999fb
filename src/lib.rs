// ABOUTME: Library root for database-bisync, a trigger-based bidirectional sync engine
// ABOUTME: Exposes the engine, its configuration, and the per-dialect adapters

pub mod adapter;
pub mod apply;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod installer;
pub mod journal;
pub mod model;
pub mod mysql;
pub mod orchestrator;
pub mod postgres;
pub mod reader;
pub mod resolver;
pub mod sqlite;
pub mod utils;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use model::{ChangeLogEntry, Operation, Side};
pub use orchestrator::SyncEngine;
