//! Server directory and manifest repository.
//!
//! The distribution engine only sees the two narrow traits below. The
//! production implementation keeps both in SQLite: one row per storage node
//! in `servers`, one row per object in `objects_metadata` with the fragment
//! list stored as JSON.

use crate::models::{
    object::{FragmentMeta, ObjectMeta},
    server::Server,
};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("malformed fragment list: {0}")]
    Json(#[from] serde_json::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Source of truth for the live storage fleet.
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    /// All registered servers. An empty fleet is `Ok(vec![])`, not an error.
    async fn list_servers(&self) -> RepositoryResult<Vec<Server>>;
}

/// Persistence for object manifests.
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Insert or fully replace the manifest stored under `meta.name`.
    async fn upsert_object_meta(&self, meta: &ObjectMeta) -> RepositoryResult<()>;

    /// Load the manifest for `name`, or `ObjectNotFound`.
    async fn get_object_meta(&self, name: &str) -> RepositoryResult<ObjectMeta>;
}

/// SQLite-backed server directory and manifest repository.
#[derive(Clone)]
pub struct SqliteMetaStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetaStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> RepositoryResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Insert a server or update its address and used space.
    pub async fn register_server(&self, server: &Server) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO servers (id, addr, used_space) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                addr = excluded.addr,
                used_space = excluded.used_space",
        )
        .bind(server.id)
        .bind(&server.addr)
        .bind(server.used_space)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Remove a server from the directory. Returns whether a row was deleted.
    pub async fn remove_server(&self, id: uuid::Uuid) -> RepositoryResult<bool> {
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ServerDirectory for SqliteMetaStore {
    async fn list_servers(&self) -> RepositoryResult<Vec<Server>> {
        let servers = sqlx::query_as::<_, Server>("SELECT id, addr, used_space FROM servers")
            .fetch_all(&*self.db)
            .await?;
        Ok(servers)
    }
}

#[async_trait]
impl MetadataRepository for SqliteMetaStore {
    async fn upsert_object_meta(&self, meta: &ObjectMeta) -> RepositoryResult<()> {
        let fragments = serde_json::to_string(&meta.fragments)?;
        sqlx::query(
            "INSERT INTO objects_metadata (name, fragments) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET fragments = excluded.fragments",
        )
        .bind(&meta.name)
        .bind(fragments)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn get_object_meta(&self, name: &str) -> RepositoryResult<ObjectMeta> {
        let fragments: String =
            sqlx::query_scalar("SELECT fragments FROM objects_metadata WHERE name = ?")
                .bind(name)
                .fetch_one(&*self.db)
                .await
                .map_err(|err| match err {
                    sqlx::Error::RowNotFound => RepositoryError::ObjectNotFound(name.to_string()),
                    other => RepositoryError::Sqlx(other),
                })?;

        let fragments: Vec<FragmentMeta> = serde_json::from_str(&fragments)?;
        Ok(ObjectMeta::new(name, fragments))
    }
}
