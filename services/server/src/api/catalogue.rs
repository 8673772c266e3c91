//! JSON catalogue endpoints: distros, releases, models, profile package
//! sets, and network profiles.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use imageforge_store::SubtargetKey;

use crate::api::error::ApiError;
use crate::state::AppState;

/// Create catalogue routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/distros", get(distros))
        .route("/releases", get(releases))
        .route("/models", get(models))
        .route("/packages_image", get(packages_image))
        .route("/network_profiles", get(network_profiles))
}

/// GET /api/distros
async fn distros(State(state): State<AppState>) -> Response {
    let names: Vec<String> = state
        .distributions()
        .names()
        .into_iter()
        .map(str::to_string)
        .collect();
    Json(names).into_response()
}

#[derive(Debug, Deserialize)]
struct ReleasesQuery {
    #[serde(default)]
    distro: String,
}

/// GET /api/releases?distro=
async fn releases(
    State(state): State<AppState>,
    Query(query): Query<ReleasesQuery>,
) -> Result<Response, ApiError> {
    if query.distro.is_empty() {
        return Err(ApiError::malformed_body());
    }
    let releases = state.db().subtargets().releases(&query.distro).await?;
    Ok(Json(releases).into_response())
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    #[serde(default)]
    distro: String,
    #[serde(default)]
    release: String,
    #[serde(default)]
    model_search: String,
}

/// GET /api/models?distro=&release=&model_search=
async fn models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Result<Response, ApiError> {
    if query.distro.is_empty() || query.release.is_empty() || query.model_search.is_empty() {
        return Err(ApiError::malformed_body());
    }
    let models = state
        .db()
        .packages()
        .models(&query.distro, &query.release, &query.model_search)
        .await?;
    Ok(Json(models).into_response())
}

#[derive(Debug, Deserialize)]
struct PackagesImageQuery {
    #[serde(default)]
    distro: String,
    #[serde(default)]
    release: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    subtarget: String,
    #[serde(default)]
    profile: String,
}

/// GET /api/packages_image?distro=&release=&target=&subtarget=&profile=
///
/// The full package set a profile's image starts from.
async fn packages_image(
    State(state): State<AppState>,
    Query(query): Query<PackagesImageQuery>,
) -> Result<Response, ApiError> {
    if query.distro.is_empty()
        || query.release.is_empty()
        || query.target.is_empty()
        || query.subtarget.is_empty()
        || query.profile.is_empty()
    {
        return Err(ApiError::malformed_body());
    }

    let key = SubtargetKey::new(&query.distro, &query.release, &query.target, &query.subtarget);
    let packages = state
        .db()
        .packages()
        .get_image_packages(&key, &query.profile)
        .await
        .map_err(|_| ApiError::malformed_body())?
        .ok_or_else(|| ApiError::not_found("unknown profile".to_string()))?;

    Ok(Json(serde_json::json!({ "packages": packages })).into_response())
}

/// GET /api/network_profiles
///
/// Directory listing of the overlay root; each subdirectory is a profile
/// whose contents get baked into images via `FILES=`.
async fn network_profiles(State(state): State<AppState>) -> Response {
    let mut profiles = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&state.config().network_profiles_dir) {
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    profiles.push(name);
                }
            }
        }
    }
    profiles.sort();
    Json(profiles).into_response()
}
