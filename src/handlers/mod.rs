//! HTTP handlers and the state they share.

use crate::services::{distribution::DistributionEngine, metadata::SqliteMetaStore};
use std::path::PathBuf;

pub mod health_handlers;
pub mod object_handlers;

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: DistributionEngine,

    /// Metadata store, used directly only by readiness checks.
    pub meta: SqliteMetaStore,

    /// Maximum accepted object size in bytes.
    pub size_limit: u64,

    /// Directory where upload bodies are spooled before fragmentation.
    pub spool_dir: PathBuf,
}
