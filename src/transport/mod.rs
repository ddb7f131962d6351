//! Fragment transport between the coordinator and storage nodes.

pub mod client;
pub mod error;
pub mod server;
pub mod wire;

pub use client::{FragmentTransport, TransportClient, TransportClientConfig};
pub use error::{TransportError, TransportResult};
pub use server::{NodeServer, NodeServerConfig};
