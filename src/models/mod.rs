//! Core data models for the fragment distribution service.
//!
//! `ObjectMeta` is the manifest persisted per object; `Server` describes one
//! storage node. Servers map to database rows via `sqlx::FromRow`, manifests
//! serialize as JSON via `serde`.

pub mod object;
pub mod server;
