//! src/services/distribution.rs
//!
//! DistributionEngine: splits objects into a fixed number of fragments,
//! scatters them over the storage fleet and reassembles them on read.
//!
//! The manifest in the metadata repository is the only record of what is
//! live. It is written once, after every fragment of a write has been
//! acknowledged by its node; fragments written by a failed attempt are left
//! on the nodes and never referenced.

use crate::{
    models::{
        object::{FragmentMeta, ObjectMeta},
        server::Server,
    },
    services::{
        fragment_id::fragment_id,
        metadata::{MetadataRepository, RepositoryError, ServerDirectory},
        object_source::ObjectSource,
        placement::{LeastUsedPlacement, PlacementError, PlacementPolicy},
    },
    transport::{FragmentTransport, TransportError},
};
use futures::future::join_all;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("no servers available")]
    NoServersAvailable,
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("server `{server_id}` holding fragment {seq_num} of `{object}` not found")]
    ServerNotFound {
        object: String,
        seq_num: u32,
        server_id: Uuid,
    },
    #[error("fragment {seq_num} ({fragment_id}) of `{object}` failed on {addr}: {source}")]
    FragmentTransferFailed {
        object: String,
        seq_num: u32,
        fragment_id: Uuid,
        addr: String,
        #[source]
        source: TransportError,
    },
    #[error("metadata store unavailable: {0}")]
    MetadataStoreUnavailable(#[source] RepositoryError),
    #[error("object name must not be empty")]
    InvalidObjectName,
    #[error("fragment count must be at least 1")]
    InvalidFragmentCount,
}

pub type DistributionResult<T> = Result<T, DistributionError>;

impl From<PlacementError> for DistributionError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::NoServersAvailable => DistributionError::NoServersAvailable,
        }
    }
}

/// Immutable engine configuration, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributionConfig {
    fragment_count: u32,
}

impl DistributionConfig {
    pub fn new(fragment_count: u32) -> DistributionResult<Self> {
        if fragment_count == 0 {
            return Err(DistributionError::InvalidFragmentCount);
        }
        Ok(Self { fragment_count })
    }

    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }
}

/// Byte length of every fragment of an object of `size` bytes.
///
/// All fragments get `size / fragment_count` bytes and the last one also
/// takes the remainder. Objects smaller than `fragment_count` bytes
/// (including empty objects) are kept whole in a single fragment.
pub fn fragment_sizes(size: u64, fragment_count: u32) -> Vec<u64> {
    let count = u64::from(fragment_count.max(1));
    if size < count {
        return vec![size];
    }
    let fragment_size = size / count;
    let last_size = size - fragment_size * (count - 1);

    let mut sizes = vec![fragment_size; (count - 1) as usize];
    sizes.push(last_size);
    sizes
}

#[derive(Clone)]
pub struct DistributionEngine {
    directory: Arc<dyn ServerDirectory>,
    repository: Arc<dyn MetadataRepository>,
    transport: Arc<dyn FragmentTransport>,
    placement: Arc<dyn PlacementPolicy>,
    config: DistributionConfig,
}

impl DistributionEngine {
    /// Engine with the default least-used-space placement.
    pub fn new(
        directory: Arc<dyn ServerDirectory>,
        repository: Arc<dyn MetadataRepository>,
        transport: Arc<dyn FragmentTransport>,
        config: DistributionConfig,
    ) -> Self {
        Self {
            directory,
            repository,
            transport,
            placement: Arc::new(LeastUsedPlacement),
            config,
        }
    }

    pub fn with_placement(mut self, placement: Arc<dyn PlacementPolicy>) -> Self {
        self.placement = placement;
        self
    }

    pub fn config(&self) -> DistributionConfig {
        self.config
    }

    async fn fleet(&self) -> DistributionResult<Vec<Server>> {
        let servers = self
            .directory
            .list_servers()
            .await
            .map_err(DistributionError::MetadataStoreUnavailable)?;
        if servers.is_empty() {
            return Err(DistributionError::NoServersAvailable);
        }
        Ok(servers)
    }

    /// Fragment `source` (`size` bytes, trusted) and persist its manifest.
    ///
    /// Fragments are transferred concurrently. Every transfer is awaited
    /// before deciding the outcome; if any failed, the lowest failing
    /// `seq_num` is reported and no manifest is written.
    pub async fn store_object(
        &self,
        name: &str,
        source: &dyn ObjectSource,
        size: u64,
    ) -> DistributionResult<ObjectMeta> {
        if name.is_empty() {
            return Err(DistributionError::InvalidObjectName);
        }

        let servers = self.fleet().await?;
        let sizes = fragment_sizes(size, self.config.fragment_count);
        let placed = self.placement.place(&servers, sizes.len())?;

        info!(
            object = name,
            size,
            fragments = sizes.len(),
            servers = servers.len(),
            "storing object"
        );

        let mut offset = 0;
        let mut transfers = Vec::with_capacity(sizes.len());
        for (seq_num, (fragment_size, server)) in sizes.into_iter().zip(placed).enumerate() {
            transfers.push(self.transfer_fragment(
                name,
                seq_num as u32,
                offset,
                fragment_size,
                server,
                source,
            ));
            offset += fragment_size;
        }

        let fragments = join_all(transfers)
            .await
            .into_iter()
            .collect::<DistributionResult<Vec<_>>>()
            .inspect_err(|err| warn!(object = name, "store failed: {}", err))?;

        let meta = ObjectMeta::new(name, fragments);
        self.repository
            .upsert_object_meta(&meta)
            .await
            .map_err(DistributionError::MetadataStoreUnavailable)?;

        info!(object = name, size, "object stored");
        Ok(meta)
    }

    async fn transfer_fragment(
        &self,
        object: &str,
        seq_num: u32,
        offset: u64,
        size: u64,
        server: Server,
        source: &dyn ObjectSource,
    ) -> DistributionResult<FragmentMeta> {
        let fragment_id = fragment_id(object, seq_num);
        let failed = |source: TransportError| DistributionError::FragmentTransferFailed {
            object: object.to_string(),
            seq_num,
            fragment_id,
            addr: server.addr.clone(),
            source,
        };

        debug!(object, seq_num, %fragment_id, addr = %server.addr, size, "sending fragment");

        let reader = source
            .open_range(offset, size)
            .await
            .map_err(|err| failed(TransportError::Source(err)))?;
        self.transport
            .store(&server.addr, fragment_id, size, reader)
            .await
            .map_err(failed)?;

        Ok(FragmentMeta {
            seq_num,
            server_id: server.id,
            fragment_id,
            size,
        })
    }

    /// Resolve everything a read needs before any byte is transferred:
    /// the manifest (sorted by `seq_num`) and the current owner of each fragment.
    pub async fn prepare_retrieval(&self, name: &str) -> DistributionResult<RetrievalPlan> {
        let mut meta = self
            .repository
            .get_object_meta(name)
            .await
            .map_err(|err| match err {
                RepositoryError::ObjectNotFound(name) => DistributionError::ObjectNotFound(name),
                other => DistributionError::MetadataStoreUnavailable(other),
            })?;
        meta.sort_fragments();

        let servers: HashMap<Uuid, Server> = self
            .fleet()
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();

        let mut targets = Vec::with_capacity(meta.fragments.len());
        for fragment in &meta.fragments {
            let server = servers.get(&fragment.server_id).cloned().ok_or_else(|| {
                DistributionError::ServerNotFound {
                    object: meta.name.clone(),
                    seq_num: fragment.seq_num,
                    server_id: fragment.server_id,
                }
            })?;
            targets.push((fragment.clone(), server));
        }

        Ok(RetrievalPlan {
            meta,
            targets,
            transport: self.transport.clone(),
        })
    }

    /// Stream object `name` into `sink` in `seq_num` order.
    ///
    /// On error the sink may already hold a prefix of the object.
    pub async fn retrieve_object<W>(&self, name: &str, sink: &mut W) -> DistributionResult<u64>
    where
        W: AsyncWrite + Send + Unpin,
    {
        self.prepare_retrieval(name).await?.stream_into(sink).await
    }
}

/// A resolved read: fragments in order, each paired with its node.
pub struct RetrievalPlan {
    meta: ObjectMeta,
    targets: Vec<(FragmentMeta, Server)>,
    transport: Arc<dyn FragmentTransport>,
}

impl RetrievalPlan {
    pub fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    pub fn total_size(&self) -> u64 {
        self.meta.total_size()
    }

    /// Download every fragment in order straight into `sink`.
    pub async fn stream_into(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> DistributionResult<u64> {
        let mut total = 0;
        for (fragment, server) in &self.targets {
            let failed = |source: TransportError| DistributionError::FragmentTransferFailed {
                object: self.meta.name.clone(),
                seq_num: fragment.seq_num,
                fragment_id: fragment.fragment_id,
                addr: server.addr.clone(),
                source,
            };

            let received = self
                .transport
                .retrieve(&server.addr, fragment.fragment_id, sink)
                .await
                .map_err(failed)?;
            if received != fragment.size {
                return Err(failed(TransportError::SizeMismatch {
                    expected: fragment.size,
                    actual: received,
                }));
            }
            total += received;
        }

        debug!(object = %self.meta.name, bytes = total, "object streamed");
        Ok(total)
    }
}
