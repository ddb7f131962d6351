//! src/services/fragment_store.rs
//!
//! FragmentStore: the storage node's local byte store. Fragments live at
//! `base_path/{shard}/{shard}/{fragment_id}`, where the two shards are the
//! first two bytes of MD5(fragment_id).

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_FRAGMENT_ID_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum FragmentStoreError {
    #[error("fragment `{0}` not found")]
    FragmentNotFound(String),
    #[error("invalid fragment id `{0}`")]
    InvalidFragmentId(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type FragmentStoreResult<T> = Result<T, FragmentStoreError>;

/// FragmentStore provides the two operations a storage node needs:
/// - store a fragment from a byte stream (durable, overwrite on conflict)
/// - open a stored fragment for streaming out
#[derive(Clone, Debug)]
pub struct FragmentStore {
    /// Base directory on disk where fragment payloads are stored.
    pub base_path: PathBuf,
}

impl FragmentStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Reject ids that could escape the shard directory.
    fn ensure_id_safe(fragment_id: &str) -> FragmentStoreResult<()> {
        let invalid = fragment_id.is_empty()
            || fragment_id.len() > MAX_FRAGMENT_ID_LEN
            || fragment_id == "."
            || fragment_id.contains("..")
            || fragment_id.starts_with(".tmp-")
            || fragment_id
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\');
        if invalid {
            return Err(FragmentStoreError::InvalidFragmentId(
                fragment_id.to_string(),
            ));
        }
        Ok(())
    }

    /// Two-level shard identifiers: the first two bytes of MD5(fragment_id)
    /// as lowercase hex (00–ff).
    fn fragment_shards(fragment_id: &str) -> (String, String) {
        let digest = md5::compute(fragment_id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Fully-qualified payload path. Parent directories may not exist yet.
    pub fn fragment_path(&self, fragment_id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::fragment_shards(fragment_id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(fragment_id);
        path
    }

    /// Stream a fragment to disk.
    ///
    /// Bytes go to a temporary file in the final directory, which is fsynced
    /// and renamed over the final path only after the stream ends cleanly.
    /// A stream error removes the temporary file and leaves any previous
    /// fragment under the same id untouched. Returns the number of bytes written.
    pub async fn store<S>(&self, fragment_id: &str, stream: S) -> FragmentStoreResult<u64>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        Self::ensure_id_safe(fragment_id)?;

        let file_path = self.fragment_path(fragment_id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            FragmentStoreError::Io(io::Error::other("fragment path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        match Self::write_file(&tmp_path, stream).await {
            Ok(written) => {
                if let Err(err) = fs::rename(&tmp_path, &file_path).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(FragmentStoreError::Io(err));
                }
                debug!(fragment_id, bytes = written, "stored fragment");
                Ok(written)
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(FragmentStoreError::Io(err))
            }
        }
    }

    async fn write_file<S>(path: &Path, stream: S) -> io::Result<u64>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let mut file = File::create(path).await?;
        let mut written: u64 = 0;
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Open a stored fragment for reading.
    ///
    /// A missing file is `FragmentNotFound`, distinct from other I/O failures.
    pub async fn open(&self, fragment_id: &str) -> FragmentStoreResult<File> {
        Self::ensure_id_safe(fragment_id)?;
        let file_path = self.fragment_path(fragment_id);
        File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                FragmentStoreError::FragmentNotFound(fragment_id.to_string())
            } else {
                FragmentStoreError::Io(err)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio::io::AsyncReadExt;

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = io::Result<Bytes>> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok::<_, io::Error>(Bytes::from_static(*p)))
                .collect::<Vec<_>>(),
        )
    }

    async fn read_back(store: &FragmentStore, id: &str) -> Vec<u8> {
        let mut file = store.open(id).await.unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn store_then_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path());
        let id = Uuid::new_v4().to_string();

        let written = store
            .store(&id, chunks(&[b"hello ", b"", b"world"]))
            .await
            .unwrap();
        assert_eq!(written, 11);
        assert_eq!(read_back(&store, &id).await, b"hello world");
    }

    #[test]
    fn path_uses_two_hex_shards() {
        let store = FragmentStore::new("/srv/fragments");
        let id = "3f2a6c1e-0000-5000-8000-000000000000";
        let path = store.fragment_path(id);
        let digest = md5::compute(id);

        let expected = PathBuf::from("/srv/fragments")
            .join(format!("{:02x}", digest[0]))
            .join(format!("{:02x}", digest[1]))
            .join(id);
        assert_eq!(path, expected);
    }

    #[tokio::test]
    async fn store_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path());

        store.store("frag", chunks(&[b"first"])).await.unwrap();
        store.store("frag", chunks(&[b"second"])).await.unwrap();
        assert_eq!(read_back(&store, "frag").await, b"second");
    }

    #[tokio::test]
    async fn failed_stream_keeps_previous_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path());
        store.store("frag", chunks(&[b"intact"])).await.unwrap();

        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "peer went away")),
        ]);
        let err = store.store("frag", broken).await.unwrap_err();
        assert!(matches!(err, FragmentStoreError::Io(_)));
        assert_eq!(read_back(&store, "frag").await, b"intact");

        let shard_dir = store.fragment_path("frag");
        let mut entries = fs::read_dir(shard_dir.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["frag".to_string()]);
    }

    #[tokio::test]
    async fn missing_fragment_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path());
        let err = store.open("absent").await.unwrap_err();
        assert!(matches!(err, FragmentStoreError::FragmentNotFound(id) if id == "absent"));
    }

    #[tokio::test]
    async fn traversal_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::new(dir.path());
        for bad in ["", "../etc", "a/b", "a\\b", ".tmp-x"] {
            let err = store.store(bad, chunks(&[b"x"])).await.unwrap_err();
            assert!(matches!(err, FragmentStoreError::InvalidFragmentId(_)), "{bad}");
        }
    }
}
