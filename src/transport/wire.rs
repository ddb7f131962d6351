//! Framing: length-prefix (4 bytes BE) + bincode payload.
//!
//! Upload:   client `Upload`, N x `Chunk`, half-close; node replies one `Status`.
//! Download: client `Download`; node replies N x `Chunk` then closes. A node
//!           failure mid-download is sent as a terminal `Status(Failed)`.

use crate::transport::error::{TransportError, TransportResult};
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Default payload size of a single `Chunk` frame.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Largest `Chunk` payload that still fits one frame. The headroom covers the
/// bincode enum tag and length prefix.
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_LEN - 1024;

/// Client -> node messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Opens an upload. `size` is the number of payload bytes that will follow.
    Upload { fragment_id: String, size: u64 },
    Download { fragment_id: String },
    Chunk { data: Vec<u8> },
}

/// Node -> client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Chunk { data: Vec<u8> },
    Status(Status),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Failed { code: FailureCode, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    FragmentIdentityRequired,
    FragmentNotFound,
    InvalidRequest,
    Internal,
}

impl Status {
    pub fn failed(code: FailureCode, message: impl Into<String>) -> Self {
        Status::Failed {
            code,
            message: message.into(),
        }
    }

    /// Map a status reply to the caller-facing result.
    pub fn into_result(self, fragment_id: &str) -> TransportResult<()> {
        match self {
            Status::Ok => Ok(()),
            Status::Failed { code, message } => Err(match code {
                FailureCode::FragmentIdentityRequired => TransportError::FragmentIdentityRequired,
                FailureCode::FragmentNotFound => {
                    TransportError::FragmentNotFound(fragment_id.to_string())
                }
                FailureCode::InvalidRequest | FailureCode::Internal => {
                    TransportError::Remote(message)
                }
            }),
        }
    }
}

pub type FrameReader<R = OwnedReadHalf> = FramedRead<R, LengthDelimitedCodec>;
pub type FrameWriter<W = OwnedWriteHalf> = FramedWrite<W, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn frame_reader<R: AsyncRead>(io: R) -> FrameReader<R> {
    FramedRead::new(io, codec())
}

pub fn frame_writer<W: AsyncWrite>(io: W) -> FrameWriter<W> {
    FramedWrite::new(io, codec())
}

pub fn encode<T: Serialize>(msg: &T) -> TransportResult<Bytes> {
    Ok(Bytes::from(bincode::serialize(msg)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> TransportResult<T> {
    Ok(bincode::deserialize(frame)?)
}

/// Encode and write one message.
pub async fn send<T, W>(writer: &mut W, msg: &T) -> TransportResult<()>
where
    T: Serialize,
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    writer.send(encode(msg)?).await?;
    Ok(())
}

/// Read and decode the next message. `None` means the peer closed its side.
pub async fn recv<T, R>(reader: &mut R) -> TransportResult<Option<T>>
where
    T: DeserializeOwned,
    R: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    match reader.next().await {
        Some(frame) => Ok(Some(decode(&frame?)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_pipe() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = frame_writer(a);
        let mut reader = frame_reader(b);

        let msgs = vec![
            Request::Upload {
                fragment_id: "f".into(),
                size: 3,
            },
            Request::Chunk {
                data: vec![1, 2, 3],
            },
        ];
        for msg in &msgs {
            send(&mut writer, msg).await.unwrap();
        }
        drop(writer);

        let mut got = Vec::new();
        while let Some(msg) = recv::<Request, _>(&mut reader).await.unwrap() {
            got.push(msg);
        }
        assert_eq!(got, msgs);
    }

    #[test]
    fn failed_status_maps_codes() {
        let err = Status::failed(FailureCode::FragmentNotFound, "gone")
            .into_result("abc")
            .unwrap_err();
        assert!(matches!(err, TransportError::FragmentNotFound(id) if id == "abc"));

        let err = Status::failed(FailureCode::FragmentIdentityRequired, "")
            .into_result("")
            .unwrap_err();
        assert!(matches!(err, TransportError::FragmentIdentityRequired));

        let err = Status::failed(FailureCode::Internal, "disk full")
            .into_result("abc")
            .unwrap_err();
        assert!(matches!(err, TransportError::Remote(msg) if msg == "disk full"));

        assert!(Status::Ok.into_result("abc").is_ok());
    }

    #[test]
    fn largest_chunk_fits_one_frame() {
        let frame = encode(&Reply::Chunk {
            data: vec![0; MAX_CHUNK_SIZE],
        })
        .unwrap();
        assert!(frame.len() <= MAX_FRAME_LEN);

        let frame = encode(&Request::Chunk {
            data: vec![0; MAX_CHUNK_SIZE],
        })
        .unwrap();
        assert!(frame.len() <= MAX_FRAME_LEN);
    }

    #[test]
    fn garbage_frame_is_codec_error() {
        let err = decode::<Reply>(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }
}
