//! HTTP handlers for object upload and download.
//!
//! Uploads are spooled to a temporary file (the engine needs a seekable
//! source and the declared size) and then fragmented from disk. Downloads
//! stream fragments through an in-process pipe into the response body.

use crate::{errors::AppError, handlers::AppState, services::object_source::FileSource};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use std::{io::ErrorKind, path::Path as FsPath};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

/// Bytes buffered between the fragment reader task and the response body.
const DOWNLOAD_PIPE_SIZE: usize = 64 * 1024;

/// `PUT /{*name}`: store an object.
pub async fn upload_object(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Body,
) -> Result<StatusCode, AppError> {
    let name = name.trim_matches('/');
    if name.is_empty() {
        return Err(AppError::bad_request("object name is required"));
    }

    fs::create_dir_all(&state.spool_dir).await?;
    let spool_path = state.spool_dir.join(format!(".upload-{}", Uuid::new_v4()));

    let result = async {
        let size = spool_body(&spool_path, body, state.size_limit).await?;
        state
            .engine
            .store_object(name, &FileSource::new(&spool_path), size)
            .await?;
        info!(object = name, size, "upload complete");
        Ok::<_, AppError>(())
    }
    .await;

    if let Err(err) = fs::remove_file(&spool_path).await {
        if err.kind() != ErrorKind::NotFound {
            warn!(
                "failed to remove spool file {}: {}",
                spool_path.display(),
                err
            );
        }
    }

    result?;
    Ok(StatusCode::OK)
}

/// Copy the request body to `path`, enforcing `limit`. Returns the byte count.
async fn spool_body(path: &FsPath, body: Body, limit: u64) -> Result<u64, AppError> {
    let mut file = File::create(path).await?;
    let mut written: u64 = 0;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|err| AppError::bad_request(format!("failed to read request body: {}", err)))?;
        written += chunk.len() as u64;
        if written > limit {
            return Err(AppError::too_large(format!(
                "object exceeds the size limit of {} bytes",
                limit
            )));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(written)
}

/// `GET /{*name}`: stream an object back.
///
/// The manifest and fragment owners are resolved before the response starts,
/// so a missing object is a clean 404. A failure while streaming ends the
/// body short of `Content-Length`, which aborts the HTTP response.
pub async fn get_object(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let name = name.trim_matches('/').to_string();
    if name.is_empty() {
        return Err(AppError::bad_request("object name is required"));
    }

    let plan = state.engine.prepare_retrieval(&name).await?;
    let total = plan.total_size();

    let (mut writer, reader) = tokio::io::duplex(DOWNLOAD_PIPE_SIZE);
    let object = name.clone();
    tokio::spawn(async move {
        match plan.stream_into(&mut writer).await {
            Ok(bytes) => info!(object, bytes, "download complete"),
            Err(err) => warn!(object, "download aborted: {}", err),
        }
    });

    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    Ok(response)
}

/// `PUT /` and `GET /`: no object name given.
pub async fn missing_name() -> AppError {
    AppError::bad_request("object name is required")
}
