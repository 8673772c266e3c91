//! Signed artifact upload from workers.
//!
//! Workers POST a multipart form with the request hash, their worker id,
//! the result archive `<hash>.zip`, and a detached usign signature
//! `<hash>.zip.sig`. The signature is verified against the public key the
//! worker registered with; only then is the archive extracted into the
//! public download tree and the request promoted to `ready`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tracing::{info, warn};

use imageforge_store::RequestStatus;

use crate::api::error::ApiError;
use crate::state::AppState;

/// Uploaded archives may carry several renamed firmware artifacts.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Create the upload route.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/upload-image", post(upload_image))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

struct UploadForm {
    request_hash: String,
    worker_id: String,
    archive_name: String,
    archive: Vec<u8>,
    signature_name: String,
    signature: String,
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut request_hash = None;
    let mut worker_id = None;
    let mut archive = None;
    let mut signature = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::bad_request("malformed upload"))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("request_hash") => {
                request_hash = Some(
                    field
                        .text()
                        .await
                        .map_err(|_| ApiError::bad_request("no request_hash"))?,
                );
            }
            Some("worker_id") => {
                worker_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|_| ApiError::bad_request("no worker_id"))?,
                );
            }
            Some("archive") => {
                let name = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::bad_request("no archive"))?;
                archive = Some((name, data.to_vec()));
            }
            Some("signature") => {
                let name = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .text()
                    .await
                    .map_err(|_| ApiError::bad_request("no signature"))?;
                signature = Some((name, data));
            }
            _ => {}
        }
    }

    let request_hash = request_hash.ok_or_else(|| ApiError::bad_request("no request_hash"))?;
    let worker_id = worker_id.ok_or_else(|| ApiError::bad_request("no worker_id"))?;
    let (archive_name, archive) = archive.ok_or_else(|| ApiError::bad_request("no archive"))?;
    let (signature_name, signature) =
        signature.ok_or_else(|| ApiError::bad_request("no signature"))?;

    Ok(UploadForm {
        request_hash,
        worker_id,
        archive_name,
        archive,
        signature_name,
        signature,
    })
}

/// POST /upload-image
async fn upload_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_form(multipart).await?;

    let archive_name = format!("{}.zip", form.request_hash);
    let signature_name = format!("{archive_name}.sig");
    if form.archive_name != archive_name {
        return Err(ApiError::bad_request("bad archive"));
    }
    if form.signature_name != signature_name {
        return Err(ApiError::bad_request("bad signature"));
    }

    let request = state
        .db()
        .requests()
        .get(&form.request_hash)
        .await?
        .ok_or_else(|| ApiError::bad_request("bad request id"))?;
    if request.status != RequestStatus::Created {
        return Err(ApiError::bad_request("bad request id"));
    }

    let worker_id: i64 = form
        .worker_id
        .parse()
        .map_err(|_| ApiError::bad_request("bad worker id"))?;
    let worker = state
        .db()
        .workers()
        .get(worker_id)
        .await?
        .ok_or_else(|| ApiError::bad_request("bad worker id"))?;

    // Stage both files before verification so a failed upload leaves
    // evidence in the scratch directory.
    let temp_dir = &state.config().temp_dir;
    fs::create_dir_all(temp_dir).map_err(|e| ApiError::internal(e.to_string()))?;
    let archive_path = temp_dir.join(&archive_name);
    fs::write(&archive_path, &form.archive).map_err(|e| ApiError::internal(e.to_string()))?;
    fs::write(temp_dir.join(&signature_name), &form.signature)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    if let Err(e) = imageforge_signing::verify(&form.archive, &form.signature, &worker.public_key)
    {
        warn!(
            request_hash = %form.request_hash,
            worker_id,
            error = %e,
            "Upload signature rejected"
        );
        return Err(ApiError::bad_request("bad signature"));
    }

    let image = state
        .db()
        .images()
        .by_request(&form.request_hash)
        .await?
        .ok_or_else(|| ApiError::bad_request("bad request id"))?;
    let target_dir = state.config().download_dir.join(image.store_path());

    let extract_result =
        tokio::task::spawn_blocking(move || extract_archive(&archive_path, &target_dir))
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
    extract_result.map_err(|e| ApiError::internal(format!("archive extraction failed: {e}")))?;

    state
        .db()
        .requests()
        .set_status(&form.request_hash, RequestStatus::Ready)
        .await?;

    info!(request_hash = %form.request_hash, worker_id, "Upload verified and published");
    Ok(Json(serde_json::json!({ "status": "ready" })).into_response())
}

/// Extract a verified archive, rejecting entries that would escape the
/// target directory.
fn extract_archive(archive_path: &Path, target_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(target_dir)?;
    let file = fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(io::Error::other)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(io::Error::other)?;
        let Some(relative) = entry.enclosed_name().map(PathBuf::from) else {
            return Err(io::Error::other(format!(
                "archive entry escapes target directory: {}",
                entry.name()
            )));
        };
        let out_path = target_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}
