//! Represents a storage node known to the server directory.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage node descriptor.
///
/// The `id` is stable across restarts and independent of the network address.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Server {
    /// Stable node identity.
    pub id: Uuid,

    /// `host:port` the node's fragment transport listens on.
    pub addr: String,

    /// Reported capacity consumption in bytes. Advisory only.
    pub used_space: i64,
}

impl Server {
    pub fn new(id: Uuid, addr: impl Into<String>, used_space: i64) -> Self {
        Self {
            id,
            addr: addr.into(),
            used_space,
        }
    }
}
