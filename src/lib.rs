//! Distributed fragment store: objects are split into a fixed number of
//! fragments, scattered over storage nodes and reassembled on read.

pub mod check;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod transport;
