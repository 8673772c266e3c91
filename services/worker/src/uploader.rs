//! Result upload client.

use std::path::Path;

use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::error::BuildError;

/// POST a signed result archive to the server's upload endpoint.
///
/// The server verifies the detached signature against this worker's
/// registered public key before publishing anything.
pub async fn upload_result(
    client: &reqwest::Client,
    server_url: &str,
    request_hash: &str,
    worker_id: i64,
    archive_path: &Path,
) -> Result<(), BuildError> {
    let archive_name = format!("{request_hash}.zip");
    let signature_name = format!("{archive_name}.sig");

    let archive = std::fs::read(archive_path)?;
    let mut signature_path = archive_path.as_os_str().to_owned();
    signature_path.push(".sig");
    let signature = std::fs::read(signature_path)?;

    let form = Form::new()
        .text("request_hash", request_hash.to_string())
        .text("worker_id", worker_id.to_string())
        .part("archive", Part::bytes(archive).file_name(archive_name))
        .part("signature", Part::bytes(signature).file_name(signature_name));

    let url = format!("{}/upload-image", server_url.trim_end_matches('/'));
    debug!(url, request_hash, "Uploading result archive");

    client
        .post(url)
        .multipart(form)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
