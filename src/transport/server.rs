//! Storage node side of the fragment transport.
//!
//! Every accepted connection carries exactly one upload or download. The
//! network half and the disk half of a transfer run concurrently and meet at
//! a bounded channel, so a slow disk stalls the socket reader (and a slow
//! peer stalls the file reader) instead of buffering a whole fragment.
//! Dropping either half fails the other's next send/recv, which is how an
//! aborted transfer releases the side blocked on the channel.

use crate::{
    services::fragment_store::{FragmentStore, FragmentStoreError},
    transport::{
        error::{TransportError, TransportResult},
        wire::{self, DEFAULT_CHUNK_SIZE, FailureCode, FrameReader, FrameWriter, Reply, Request, Status},
    },
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt, stream};
use std::{future::Future, io, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Chunks buffered between the network and disk halves of one transfer.
const PIPE_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct NodeServerConfig {
    /// Payload bytes per outgoing `Chunk` frame.
    pub chunk_size: usize,
    pub pipe_capacity: usize,
}

impl Default for NodeServerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pipe_capacity: PIPE_CAPACITY,
        }
    }
}

/// Serves the fragment transport for one `FragmentStore`.
#[derive(Debug, Clone)]
pub struct NodeServer {
    store: FragmentStore,
    config: NodeServerConfig,
}

impl NodeServer {
    pub fn new(store: FragmentStore, config: NodeServerConfig) -> Self {
        Self { store, config }
    }

    /// Accept connections until `shutdown` resolves. Each connection runs on
    /// its own task; a failing transfer is logged and does not stop the loop.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("storage node shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!("failed to accept connection: {}", err);
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream).await {
                            warn!(%peer, "fragment transfer failed: {}", err);
                        }
                    });
                }
            }
        }
    }

    /// Run a single transfer over `stream`.
    pub async fn handle_connection(&self, stream: TcpStream) -> TransportResult<()> {
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let mut reader = wire::frame_reader(read);
        let mut writer = wire::frame_writer(write);

        let request = match wire::recv::<Request, _>(&mut reader).await? {
            Some(request) => request,
            None => return Ok(()),
        };

        match request {
            Request::Upload { fragment_id, size } => {
                if fragment_id.is_empty() {
                    return reject_identity(&mut writer).await;
                }
                self.handle_upload(fragment_id, size, reader, writer).await
            }
            Request::Download { fragment_id } => {
                if fragment_id.is_empty() {
                    return reject_identity(&mut writer).await;
                }
                self.handle_download(fragment_id, writer).await
            }
            Request::Chunk { .. } => {
                let status = Status::failed(
                    FailureCode::InvalidRequest,
                    "transfer must start with Upload or Download",
                );
                wire::send(&mut writer, &Reply::Status(status)).await?;
                Err(TransportError::UnexpectedMessage("chunk before initiation"))
            }
        }
    }

    async fn handle_upload(
        &self,
        fragment_id: String,
        size: u64,
        mut reader: FrameReader,
        mut writer: FrameWriter,
    ) -> TransportResult<()> {
        let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(self.config.pipe_capacity);

        let network = async move {
            let mut received: u64 = 0;
            loop {
                let chunk = match wire::recv::<Request, _>(&mut reader).await {
                    Ok(Some(Request::Chunk { data })) => {
                        received += data.len() as u64;
                        if received > size {
                            Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("upload exceeds declared size of {} bytes", size),
                            ))
                        } else {
                            Ok(Bytes::from(data))
                        }
                    }
                    Ok(None) if received == size => return,
                    Ok(None) => Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("upload ended after {} of {} bytes", received, size),
                    )),
                    Ok(Some(_)) => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected message during upload",
                    )),
                    Err(err) => Err(io::Error::other(err)),
                };
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    return;
                }
            }
        };
        let disk = self
            .store
            .store(&fragment_id, stream::poll_fn(move |cx| rx.poll_recv(cx)));

        let ((), stored) = tokio::join!(network, disk);

        let status = match &stored {
            Ok(bytes) => {
                debug!(fragment_id, bytes, "upload stored");
                Status::Ok
            }
            Err(err) => store_failure(err),
        };
        wire::send(&mut writer, &Reply::Status(status)).await?;
        SinkExt::<Bytes>::close(&mut writer).await?;

        stored.map(|_| ()).map_err(into_transport_error)
    }

    async fn handle_download(
        &self,
        fragment_id: String,
        mut writer: FrameWriter,
    ) -> TransportResult<()> {
        let file = match self.store.open(&fragment_id).await {
            Ok(file) => file,
            Err(err) => {
                wire::send(&mut writer, &Reply::Status(store_failure(&err))).await?;
                return Err(into_transport_error(err));
            }
        };

        let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(self.config.pipe_capacity);
        let chunk_size = self.config.chunk_size;

        let disk = async move {
            let mut chunks = ReaderStream::with_capacity(file, chunk_size);
            while let Some(chunk) = chunks.next().await {
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    return;
                }
            }
        };
        let network = async move {
            let mut sent: u64 = 0;
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    Ok(data) => {
                        sent += data.len() as u64;
                        wire::send(&mut writer, &Reply::Chunk {
                            data: data.to_vec(),
                        })
                        .await?;
                    }
                    Err(err) => {
                        let status = Status::failed(FailureCode::Internal, err.to_string());
                        wire::send(&mut writer, &Reply::Status(status)).await?;
                        return Err(TransportError::Io(err));
                    }
                }
            }
            SinkExt::<Bytes>::close(&mut writer).await?;
            Ok(sent)
        };

        let ((), sent) = tokio::join!(disk, network);
        let sent = sent?;
        debug!(fragment_id, bytes = sent, "download served");
        Ok(())
    }
}

async fn reject_identity(writer: &mut FrameWriter) -> TransportResult<()> {
    let status = Status::failed(
        FailureCode::FragmentIdentityRequired,
        TransportError::FragmentIdentityRequired.to_string(),
    );
    wire::send(writer, &Reply::Status(status)).await?;
    Err(TransportError::FragmentIdentityRequired)
}

fn store_failure(err: &FragmentStoreError) -> Status {
    let code = match err {
        FragmentStoreError::FragmentNotFound(_) => FailureCode::FragmentNotFound,
        FragmentStoreError::InvalidFragmentId(_) => FailureCode::InvalidRequest,
        FragmentStoreError::Io(_) => FailureCode::Internal,
    };
    Status::failed(code, err.to_string())
}

fn into_transport_error(err: FragmentStoreError) -> TransportError {
    match err {
        FragmentStoreError::FragmentNotFound(id) => TransportError::FragmentNotFound(id),
        FragmentStoreError::InvalidFragmentId(id) => {
            TransportError::Remote(format!("invalid fragment id `{}`", id))
        }
        FragmentStoreError::Io(err) => TransportError::Io(err),
    }
}
