//! Build request intake.
//!
//! Three POST endpoints share one validation pipeline: resolve the
//! distribution and release, check the subtarget is known and supported,
//! vet the package list against the catalogue, canonicalise the profile,
//! fingerprint the request, and deduplicate it into the build queue.
//!
//! Responses: `200` with image info for finished requests, `201` with a
//! status object while provisioning or building, `400` for every
//! validation failure.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use imageforge_fingerprint::{self as fingerprint, RequestIdentity};
use imageforge_store::{
    NewRequest, ProvisionState, RequestStatus, StoredImage, SubtargetKey, Supported,
};

use crate::api::error::ApiError;
use crate::state::AppState;

/// Package names accepted without a catalogue entry. They cannot be
/// installed but clients tend to submit them because every manifest lists
/// them.
const IMPLICIT_PACKAGES: [&str; 3] = ["kernel", "libc", "base-files"];

/// Create intake routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/upgrade-check", post(upgrade_check))
        .route("/upgrade-request", post(build_request))
        .route("/build-request", post(build_request))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Incoming build request body. Everything is optional at the serde layer
/// so that missing fields produce a proper error message instead of a
/// deserialisation failure.
#[derive(Debug, Deserialize)]
struct RequestBody {
    #[serde(default)]
    distro: Option<String>,

    #[serde(default)]
    version: Option<String>,

    #[serde(default)]
    target: Option<String>,

    #[serde(default)]
    subtarget: Option<String>,

    #[serde(default)]
    profile: Option<String>,

    #[serde(default)]
    packages: Vec<String>,

    #[serde(default)]
    network_profile: Option<String>,
}

/// Status object returned while a request is provisioning or building.
#[derive(Debug, Serialize)]
struct StatusResponse {
    status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    request_hash: Option<String>,
}

/// Image info returned for finished requests.
#[derive(Debug, Serialize)]
struct ImageInfoResponse {
    status: String,
    request_hash: String,
    image_hash: String,
    url: String,
    checksum: String,
    filesize: i64,
    build_date: String,
}

/// Response for `/upgrade-check`.
#[derive(Debug, Serialize)]
struct UpgradeCheckResponse {
    distro: String,
    version: String,
    latest: String,
    upgrade_available: bool,
}

// =============================================================================
// Handlers
// =============================================================================

/// Check whether a newer release exists for a device.
///
/// POST /api/upgrade-check
async fn upgrade_check(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body = parse_body(&body)?;
    let (distro, release) = resolve_distro_release(&state, &body).await?;
    resolve_subtarget(&state, &distro, &release, &body).await?;

    let latest = state
        .distributions()
        .get(&distro)
        .map(|d| d.latest.clone())
        .unwrap_or_else(|| release.clone());

    let upgrade_available = release != latest;
    Ok(Json(UpgradeCheckResponse {
        distro,
        version: release,
        latest,
        upgrade_available,
    })
    .into_response())
}

/// Request an image build, deduplicated by fingerprint.
///
/// POST /api/upgrade-request
/// POST /api/build-request
async fn build_request(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body = parse_body(&body)?;

    if body.target.as_deref().unwrap_or_default().is_empty()
        || body.subtarget.as_deref().unwrap_or_default().is_empty()
        || body.profile.as_deref().unwrap_or_default().is_empty()
    {
        return Err(missing_fields(&body, true));
    }

    let (distro, release) = resolve_distro_release(&state, &body).await?;
    let key = resolve_subtarget(&state, &distro, &release, &body).await?;

    // A catalogue that was never synced, or has aged out, means the
    // imagebuilder must be (re)provisioned before the package list can be
    // trusted. The client polls until a worker picks it up.
    if state.db().subtargets().outdated(&key).await? {
        state.db().imagebuilders().ensure(&key).await?;
        debug!(subtarget = %key, "Package catalogue stale, provisioning requested");
        return Ok(queued_response("imagebuilder", None));
    }

    check_packages(&state, &key, &body.packages).await?;

    let network_profile = match body.network_profile.as_deref() {
        None | Some("") => String::new(),
        Some(profile) => {
            let path = state.config().network_profiles_dir.join(profile);
            if !path.is_dir() {
                return Err(ApiError::bad_request(format!(
                    "unknown network profile {profile}"
                )));
            }
            profile.to_string()
        }
    };

    let packages_hash = fingerprint::packages_hash(&body.packages);
    state
        .db()
        .packages()
        .ensure_packages_hash(&packages_hash, &body.packages)
        .await?;

    let submitted_profile = body.profile.as_deref().unwrap_or_default();
    let profile = state
        .db()
        .packages()
        .resolve_profile(&key, submitted_profile)
        .await?
        .ok_or_else(|| ApiError::bad_request(format!("unknown profile {submitted_profile}")))?;

    let request_hash = fingerprint::request_hash(&RequestIdentity {
        distro: &key.distro,
        release: &key.release,
        target: &key.target,
        subtarget: &key.subtarget,
        profile: &profile.name,
        packages_hash: &packages_hash,
        network_profile: &network_profile,
    })
    .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let status = state
        .db()
        .requests()
        .find_or_insert(&NewRequest {
            request_hash: request_hash.clone(),
            key: key.clone(),
            profile: profile.name.clone(),
            packages_hash,
            network_profile,
        })
        .await?;

    match status {
        RequestStatus::Ready | RequestStatus::Created => {
            let image = state
                .db()
                .images()
                .by_request(&request_hash)
                .await?
                .ok_or_else(|| ApiError::internal("image row missing for finished request"))?;
            Ok(image_response(&state, status, &request_hash, &image))
        }
        RequestStatus::Requested | RequestStatus::Building => {
            // The build can only be claimed once a worker holds the skill;
            // surface provisioning state to the polling client.
            let provision = state.db().imagebuilders().ensure(&key).await?;
            if provision == ProvisionState::Requested {
                info!(subtarget = %key, request_hash = %request_hash, "Awaiting imagebuilder");
                return Ok(queued_response("imagebuilder", Some(&request_hash)));
            }
            Ok(queued_response(status.as_str(), Some(&request_hash)))
        }
        RequestStatus::BuildFail | RequestStatus::ImagesizeFail | RequestStatus::SigningFail => {
            Ok((
                StatusCode::OK,
                Json(StatusResponse {
                    status: status.as_str().to_string(),
                    request_hash: Some(request_hash),
                }),
            )
                .into_response())
        }
    }
}

// =============================================================================
// Pipeline steps
// =============================================================================

fn parse_body(bytes: &Bytes) -> Result<RequestBody, ApiError> {
    serde_json::from_slice(bytes).map_err(|_| ApiError::malformed_body())
}

fn missing_fields(body: &RequestBody, require_profile: bool) -> ApiError {
    let mut missing = Vec::new();
    if body.target.as_deref().unwrap_or_default().is_empty() {
        missing.push("target");
    }
    if body.subtarget.as_deref().unwrap_or_default().is_empty() {
        missing.push("subtarget");
    }
    if require_profile && body.profile.as_deref().unwrap_or_default().is_empty() {
        missing.push("profile");
    }
    ApiError::bad_request(format!("missing parameters - need {}", missing.join(" ")))
}

async fn resolve_distro_release(
    state: &AppState,
    body: &RequestBody,
) -> Result<(String, String), ApiError> {
    let distributions = state.distributions();

    let distro = match &body.distro {
        None => distributions.default.clone(),
        Some(distro) => distro.to_lowercase(),
    };
    let Some(distribution) = distributions.get(&distro) else {
        return Err(ApiError::bad_request(format!(
            "unknown distribution {distro}"
        )));
    };

    let release = match &body.version {
        None => distribution.latest.clone(),
        Some(version) => {
            let version = version.to_lowercase();
            let known = state.db().subtargets().releases(&distro).await?;
            if version != distribution.latest && !known.contains(&version) {
                return Err(ApiError::bad_request(format!("unknown release {version}")));
            }
            version
        }
    };

    Ok((distro, release))
}

async fn resolve_subtarget(
    state: &AppState,
    distro: &str,
    release: &str,
    body: &RequestBody,
) -> Result<SubtargetKey, ApiError> {
    let target = body.target.as_deref().unwrap_or_default();
    let subtarget = body.subtarget.as_deref().unwrap_or_default();
    if target.is_empty() || subtarget.is_empty() {
        return Err(missing_fields(body, false));
    }

    let key = SubtargetKey::new(distro, release, target, subtarget);
    let Some(row) = state.db().subtargets().get(&key).await? else {
        return Err(ApiError::bad_request(format!(
            "unknown target {target}/{subtarget}"
        )));
    };
    if row.supported != Supported::Yes {
        return Err(ApiError::bad_request(format!(
            "target currently not supported {target}/{subtarget}"
        )));
    }
    Ok(key)
}

async fn check_packages(
    state: &AppState,
    key: &SubtargetKey,
    packages: &[String],
) -> Result<(), ApiError> {
    if packages.is_empty() {
        return Ok(());
    }

    let available = state.db().packages().get_packages_available(key).await?;
    for package in packages {
        if IMPLICIT_PACKAGES.contains(&package.as_str()) {
            continue;
        }
        if !available.iter().any(|(name, _)| name == package) {
            return Err(ApiError::bad_request(format!(
                "could not find package '{package}' for requested target"
            )));
        }
    }
    Ok(())
}

fn queued_response(status: &str, request_hash: Option<&str>) -> Response {
    (
        StatusCode::CREATED,
        Json(StatusResponse {
            status: status.to_string(),
            request_hash: request_hash.map(str::to_string),
        }),
    )
        .into_response()
}

fn image_response(
    state: &AppState,
    status: RequestStatus,
    request_hash: &str,
    image: &StoredImage,
) -> Response {
    let url = format!(
        "{}/download/{}/{}",
        state.config().server_url.trim_end_matches('/'),
        image.store_path(),
        image.sysupgrade_filename(),
    );
    let build_date = DateTime::from_timestamp(image.build_date, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();

    Json(ImageInfoResponse {
        status: status.as_str().to_string(),
        request_hash: request_hash.to_string(),
        image_hash: image.image_hash.clone(),
        url,
        checksum: image.checksum.clone(),
        filesize: image.filesize,
        build_date,
    })
    .into_response()
}
