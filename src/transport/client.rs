//! Coordinator side of the fragment transport.
//!
//! One TCP connection per fragment transfer. Uploads stream a bounded range
//! reader in fixed-size chunks; downloads copy received chunks straight into
//! the caller's sink.

use crate::{
    services::object_source::RangeReader,
    transport::{
        error::{TransportError, TransportResult},
        wire::{self, DEFAULT_CHUNK_SIZE, FrameReader, FrameWriter, Reply, Request, Status},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

/// Moves fragment bytes between the coordinator and storage nodes.
#[async_trait]
pub trait FragmentTransport: Send + Sync {
    /// Upload exactly `size` bytes from `data` as fragment `fragment_id`.
    async fn store(
        &self,
        addr: &str,
        fragment_id: Uuid,
        size: u64,
        data: RangeReader,
    ) -> TransportResult<()>;

    /// Download fragment `fragment_id` into `sink`. Returns the bytes written.
    async fn retrieve(
        &self,
        addr: &str,
        fragment_id: Uuid,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> TransportResult<u64>;
}

/// TCP client configuration.
#[derive(Debug, Clone)]
pub struct TransportClientConfig {
    /// Payload bytes per `Chunk` frame.
    pub chunk_size: usize,
    pub connect_timeout: Duration,
}

impl Default for TransportClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransportClient {
    config: TransportClientConfig,
}

impl TransportClient {
    pub fn new(config: TransportClientConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, addr: &str) -> TransportResult<(FrameReader, FrameWriter)> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout.as_millis() as u64,
            })??;
        stream.set_nodelay(true)?;
        debug!(addr, "connected to storage node");

        let (read, write) = stream.into_split();
        Ok((wire::frame_reader(read), wire::frame_writer(write)))
    }

    async fn send_chunks(
        &self,
        writer: &mut FrameWriter,
        data: RangeReader,
    ) -> TransportResult<u64> {
        let mut chunks = ReaderStream::with_capacity(data, self.config.chunk_size);
        let mut sent: u64 = 0;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(TransportError::Source)?;
            sent += chunk.len() as u64;
            wire::send(writer, &Request::Chunk {
                data: chunk.to_vec(),
            })
            .await?;
        }
        // Half-close: the node reads end-of-upload from this.
        SinkExt::<Bytes>::close(writer).await?;
        Ok(sent)
    }

    /// Read the node's terminal status, if it sent one.
    async fn read_status(reader: &mut FrameReader) -> TransportResult<Status> {
        match wire::recv::<Reply, _>(reader).await? {
            Some(Reply::Status(status)) => Ok(status),
            Some(Reply::Chunk { .. }) => Err(TransportError::UnexpectedMessage(
                "chunk in upload reply",
            )),
            None => Err(TransportError::UnexpectedEof("upload status")),
        }
    }
}

#[async_trait]
impl FragmentTransport for TransportClient {
    async fn store(
        &self,
        addr: &str,
        fragment_id: Uuid,
        size: u64,
        data: RangeReader,
    ) -> TransportResult<()> {
        let id = fragment_id.to_string();
        let (mut reader, mut writer) = self.connect(addr).await?;

        wire::send(&mut writer, &Request::Upload {
            fragment_id: id.clone(),
            size,
        })
        .await?;

        match self.send_chunks(&mut writer, data).await {
            Ok(sent) if sent != size => {
                return Err(TransportError::SizeMismatch {
                    expected: size,
                    actual: sent,
                });
            }
            Ok(_) => {}
            Err(err @ TransportError::Io(_)) => {
                // The node may have rejected the upload and closed early;
                // prefer its reason over the broken pipe.
                let status = tokio::time::timeout(
                    self.config.connect_timeout,
                    Self::read_status(&mut reader),
                )
                .await;
                return match status {
                    Ok(Ok(status @ Status::Failed { .. })) => status.into_result(&id),
                    _ => Err(err),
                };
            }
            // Source failures return at once. Dropping both halves ends the
            // connection short of `size`, so the node discards the upload.
            Err(err) => return Err(err),
        }

        Self::read_status(&mut reader).await?.into_result(&id)?;
        debug!(addr, fragment_id = %id, bytes = size, "fragment uploaded");
        Ok(())
    }

    async fn retrieve(
        &self,
        addr: &str,
        fragment_id: Uuid,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> TransportResult<u64> {
        let id = fragment_id.to_string();
        let (mut reader, mut writer) = self.connect(addr).await?;

        wire::send(&mut writer, &Request::Download {
            fragment_id: id.clone(),
        })
        .await?;
        SinkExt::<Bytes>::close(&mut writer).await?;

        let mut received: u64 = 0;
        while let Some(reply) = wire::recv::<Reply, _>(&mut reader).await? {
            match reply {
                Reply::Chunk { data } => {
                    sink.write_all(&data).await?;
                    received += data.len() as u64;
                }
                Reply::Status(status) => {
                    status.into_result(&id)?;
                    break;
                }
            }
        }
        sink.flush().await?;

        debug!(addr, fragment_id = %id, bytes = received, "fragment downloaded");
        Ok(received)
    }
}
