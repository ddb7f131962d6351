//! Core services: fragment identity and placement, the distribution engine
//! that drives writes and reads, and the storage node's local fragment store.

pub mod distribution;
pub mod fragment_id;
pub mod fragment_store;
pub mod metadata;
pub mod object_source;
pub mod placement;
