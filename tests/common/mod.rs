//! Shared fixtures: an in-memory metadata store and real storage nodes on
//! loopback listeners.

#![allow(dead_code)]

use fragstore::{
    models::server::Server,
    services::{
        distribution::{DistributionConfig, DistributionEngine},
        fragment_store::FragmentStore,
        metadata::SqliteMetaStore,
    },
    transport::{NodeServer, NodeServerConfig, TransportClient, TransportClientConfig},
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::net::TcpListener;
use uuid::Uuid;

/// Small enough that every fragment spans several frames.
pub const CHUNK_SIZE: usize = 4096;

pub struct Node {
    pub server: Server,
    pub store: FragmentStore,
    _dir: TempDir,
}

pub async fn meta_store() -> SqliteMetaStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteMetaStore::new(Arc::new(pool));
    store.migrate().await.unwrap();
    store
}

/// Start a storage node and register it with `used_space`.
pub async fn start_node(meta: &SqliteMetaStore, used_space: i64) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let store = FragmentStore::new(dir.path());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let node = Arc::new(NodeServer::new(
        store.clone(),
        NodeServerConfig {
            chunk_size: CHUNK_SIZE,
            ..NodeServerConfig::default()
        },
    ));
    tokio::spawn(node.serve(listener, std::future::pending()));

    let server = Server::new(Uuid::new_v4(), addr, used_space);
    meta.register_server(&server).await.unwrap();
    Node {
        server,
        store,
        _dir: dir,
    }
}

/// An address nothing listens on.
pub async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

pub fn engine(meta: &SqliteMetaStore, fragment_count: u32) -> DistributionEngine {
    let transport = TransportClient::new(TransportClientConfig {
        chunk_size: CHUNK_SIZE,
        connect_timeout: Duration::from_secs(2),
    });
    DistributionEngine::new(
        Arc::new(meta.clone()),
        Arc::new(meta.clone()),
        Arc::new(transport),
        DistributionConfig::new(fragment_count).unwrap(),
    )
}

/// Deterministic, non-repeating-per-chunk payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
