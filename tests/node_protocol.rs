//! Storage node behavior as seen on the wire.

mod common;

use bytes::Bytes;
use common::{CHUNK_SIZE, meta_store, payload, start_node};
use fragstore::{
    services::fragment_store::FragmentStore,
    transport::{
        FragmentTransport, NodeServer, NodeServerConfig, TransportClient, TransportError,
        TransportResult,
        wire::{self, FailureCode, FrameReader, FrameWriter, Reply, Request, Status},
    },
};
use futures::{SinkExt, stream};
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncRead, ReadBuf},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::timeout,
};
use uuid::Uuid;

const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

async fn open(addr: &str) -> (FrameReader, FrameWriter) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, write) = stream.into_split();
    (wire::frame_reader(read), wire::frame_writer(write))
}

async fn status(reader: &mut FrameReader) -> Status {
    match wire::recv::<Reply, _>(reader).await.unwrap() {
        Some(Reply::Status(status)) => status,
        other => panic!("expected a status, got {other:?}"),
    }
}

fn failure_code(status: Status) -> FailureCode {
    match status {
        Status::Failed { code, .. } => code,
        Status::Ok => panic!("expected a failure"),
    }
}

#[tokio::test]
async fn empty_fragment_id_is_rejected() {
    let meta = meta_store().await;
    let node = start_node(&meta, 0).await;

    let (mut reader, mut writer) = open(&node.server.addr).await;
    wire::send(&mut writer, &Request::Download {
        fragment_id: String::new(),
    })
    .await
    .unwrap();

    assert_eq!(
        failure_code(status(&mut reader).await),
        FailureCode::FragmentIdentityRequired
    );
}

#[tokio::test]
async fn download_of_unknown_fragment_is_not_found() {
    let meta = meta_store().await;
    let node = start_node(&meta, 0).await;

    let client = TransportClient::default();
    let mut sink = Vec::new();
    let err = client
        .retrieve(&node.server.addr, Uuid::new_v4(), &mut sink)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::FragmentNotFound(_)));
}

#[tokio::test]
async fn truncated_upload_is_not_committed() {
    let meta = meta_store().await;
    let node = start_node(&meta, 0).await;
    let id = Uuid::new_v4().to_string();

    let (mut reader, mut writer) = open(&node.server.addr).await;
    wire::send(&mut writer, &Request::Upload {
        fragment_id: id.clone(),
        size: 10,
    })
    .await
    .unwrap();
    wire::send(&mut writer, &Request::Chunk {
        data: b"hello".to_vec(),
    })
    .await
    .unwrap();
    SinkExt::<Bytes>::close(&mut writer).await.unwrap();

    assert!(matches!(status(&mut reader).await, Status::Failed { .. }));
    assert!(!node.store.fragment_path(&id).exists());
}

#[tokio::test]
async fn oversized_upload_is_not_committed() {
    let meta = meta_store().await;
    let node = start_node(&meta, 0).await;
    let id = Uuid::new_v4().to_string();

    let (mut reader, mut writer) = open(&node.server.addr).await;
    wire::send(&mut writer, &Request::Upload {
        fragment_id: id.clone(),
        size: 2,
    })
    .await
    .unwrap();
    wire::send(&mut writer, &Request::Chunk {
        data: b"too long".to_vec(),
    })
    .await
    .unwrap();
    SinkExt::<Bytes>::close(&mut writer).await.unwrap();

    assert!(matches!(status(&mut reader).await, Status::Failed { .. }));
    assert!(!node.store.fragment_path(&id).exists());
}

#[tokio::test]
async fn chunk_before_upload_is_an_invalid_request() {
    let meta = meta_store().await;
    let node = start_node(&meta, 0).await;

    let (mut reader, mut writer) = open(&node.server.addr).await;
    wire::send(&mut writer, &Request::Chunk { data: vec![1, 2, 3] })
        .await
        .unwrap();

    assert_eq!(
        failure_code(status(&mut reader).await),
        FailureCode::InvalidRequest
    );
}

#[tokio::test]
async fn upload_then_download_over_the_wire() {
    let meta = meta_store().await;
    let node = start_node(&meta, 0).await;
    let id = Uuid::new_v4().to_string();
    let data = common::payload(3 * common::CHUNK_SIZE + 17);

    let (mut reader, mut writer) = open(&node.server.addr).await;
    wire::send(&mut writer, &Request::Upload {
        fragment_id: id.clone(),
        size: data.len() as u64,
    })
    .await
    .unwrap();
    for chunk in data.chunks(1000) {
        wire::send(&mut writer, &Request::Chunk {
            data: chunk.to_vec(),
        })
        .await
        .unwrap();
    }
    SinkExt::<Bytes>::close(&mut writer).await.unwrap();
    assert_eq!(status(&mut reader).await, Status::Ok);

    let (mut reader, mut writer) = open(&node.server.addr).await;
    wire::send(&mut writer, &Request::Download {
        fragment_id: id.clone(),
    })
    .await
    .unwrap();

    let mut received = Vec::new();
    let mut frames = 0;
    while let Some(reply) = wire::recv::<Reply, _>(&mut reader).await.unwrap() {
        match reply {
            Reply::Chunk { data } => {
                assert!(data.len() <= common::CHUNK_SIZE);
                received.extend_from_slice(&data);
                frames += 1;
            }
            Reply::Status(status) => panic!("unexpected status: {status:?}"),
        }
    }
    assert_eq!(received, data);
    assert!(frames >= 4);
}

/// Yields ten bytes, then fails.
#[derive(Default)]
struct FailingReader {
    sent: bool,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.sent {
            return Poll::Ready(Err(io::Error::other("source went away")));
        }
        self.sent = true;
        buf.put_slice(&[7; 10]);
        Poll::Ready(Ok(()))
    }
}

fn node_with_pipe(pipe_capacity: usize) -> (Arc<NodeServer>, FragmentStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = FragmentStore::new(dir.path());
    let node = Arc::new(NodeServer::new(
        store.clone(),
        NodeServerConfig {
            chunk_size: CHUNK_SIZE,
            pipe_capacity,
        },
    ));
    (node, store, dir)
}

/// Serve exactly one connection; the handle yields the listener back with
/// the connection's outcome once the node is done with it.
async fn accept_once(
    node: Arc<NodeServer>,
) -> (String, JoinHandle<(TcpListener, TransportResult<()>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let outcome = node.handle_connection(stream).await;
        (listener, outcome)
    });
    (addr, handle)
}

fn tmp_files(store: &FragmentStore, id: &str) -> usize {
    let path = store.fragment_path(id);
    let shard = path.parent().unwrap();
    match std::fs::read_dir(shard) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn source_read_error_aborts_the_upload() {
    let (node, store, _dir) = node_with_pipe(8);
    let (addr, served) = accept_once(node).await;
    let id = Uuid::new_v4();

    let client = TransportClient::default();
    let result = timeout(
        RELEASE_TIMEOUT,
        client.store(&addr, id, 100, Box::pin(FailingReader::default())),
    )
    .await
    .expect("store blocked after a source read error");
    assert!(matches!(result, Err(TransportError::Source(_))));

    let (_, outcome) = timeout(RELEASE_TIMEOUT, served)
        .await
        .expect("node blocked after the client gave up")
        .unwrap();
    assert!(outcome.is_err());
    assert!(!store.fragment_path(&id.to_string()).exists());
    assert_eq!(tmp_files(&store, &id.to_string()), 0);
}

#[tokio::test]
async fn dropped_download_releases_the_node() {
    let (node, store, _dir) = node_with_pipe(1);
    let id = Uuid::new_v4();
    let data = payload(8 * 1024 * 1024);
    let chunks = data
        .chunks(CHUNK_SIZE)
        .map(|c| Ok::<_, io::Error>(Bytes::copy_from_slice(c)))
        .collect::<Vec<_>>();
    store
        .store(&id.to_string(), stream::iter(chunks))
        .await
        .unwrap();

    let (addr, served) = accept_once(node.clone()).await;
    let (mut reader, mut writer) = open(&addr).await;
    wire::send(&mut writer, &Request::Download {
        fragment_id: id.to_string(),
    })
    .await
    .unwrap();
    match wire::recv::<Reply, _>(&mut reader).await.unwrap() {
        Some(Reply::Chunk { .. }) => {}
        other => panic!("expected a chunk, got {other:?}"),
    }
    drop(reader);
    drop(writer);

    let (listener, _) = timeout(RELEASE_TIMEOUT, served)
        .await
        .expect("download task still blocked after the peer left")
        .unwrap();

    tokio::spawn(node.serve(listener, std::future::pending()));
    let mut sink = Vec::new();
    let n = TransportClient::default()
        .retrieve(&addr, id, &mut sink)
        .await
        .unwrap();
    assert_eq!(n, data.len() as u64);
    assert_eq!(sink, data);
}

#[tokio::test]
#[allow(deprecated)]
async fn reset_upload_leaves_nothing_behind() {
    let (node, store, _dir) = node_with_pipe(1);
    let (addr, served) = accept_once(node).await;
    let id = Uuid::new_v4().to_string();

    let stream = TcpStream::connect(&addr).await.unwrap();
    // Zero linger turns the close into a reset.
    stream.set_linger(Some(Duration::ZERO)).unwrap();
    let mut writer = wire::frame_writer(stream);
    wire::send(&mut writer, &Request::Upload {
        fragment_id: id.clone(),
        size: 1024 * 1024,
    })
    .await
    .unwrap();
    for _ in 0..16 {
        wire::send(&mut writer, &Request::Chunk {
            data: vec![9; CHUNK_SIZE],
        })
        .await
        .unwrap();
    }
    drop(writer);

    let (_, outcome) = timeout(RELEASE_TIMEOUT, served)
        .await
        .expect("upload task still blocked after the reset")
        .unwrap();
    assert!(outcome.is_err());
    assert!(!store.fragment_path(&id).exists());
    assert_eq!(tmp_files(&store, &id), 0);
}
