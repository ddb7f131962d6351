//! End-to-end smoke check against a running API: upload a local file,
//! download it back and compare MD5 digests.

use anyhow::{Context, Result, bail};
use reqwest::{Client, StatusCode};
use std::{
    path::Path,
    time::{Duration, Instant},
};
use tracing::info;

#[derive(Debug, Clone)]
pub struct CheckReport {
    pub url: String,
    pub size: u64,
    pub digest: String,
    pub upload: Duration,
    pub download: Duration,
}

/// Upload `file` to `server` under its file name and verify the round trip.
pub async fn run_check(server: &str, file: &Path) -> Result<CheckReport> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", file.display()))?;
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let url = format!("{}/{}", server.trim_end_matches('/'), name);
    let client = Client::new();

    info!(url, size = data.len(), "uploading");
    let started = Instant::now();
    let resp = client
        .put(&url)
        .body(data.clone())
        .send()
        .await
        .with_context(|| format!("PUT {}", url))?;
    if resp.status() != StatusCode::OK {
        bail!("upload failed: unexpected status code {}", resp.status());
    }
    let upload = started.elapsed();

    info!(url, "downloading");
    let started = Instant::now();
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {}", url))?;
    if resp.status() != StatusCode::OK {
        bail!("download failed: unexpected status code {}", resp.status());
    }
    let body = resp.bytes().await.context("reading download body")?;
    let download = started.elapsed();

    let expected = md5::compute(&data);
    let actual = md5::compute(&body);
    if expected != actual {
        bail!(
            "files are not equal: expected {} bytes ({:x}), got {} bytes ({:x})",
            data.len(),
            expected,
            body.len(),
            actual
        );
    }

    Ok(CheckReport {
        url,
        size: data.len() as u64,
        digest: format!("{:x}", expected),
        upload,
        download,
    })
}
