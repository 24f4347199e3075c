//! Row-level REST surface over the store: filtered reads, reads by id,
//! owner-checked inserts and the like toggle.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use slope_store::{DataStore, StoreError};
use slope_types::api::{self as wire, Filter, LikeToggle, ToggleLikeRequest, owner_of};
use slope_types::events::Resource;
use slope_types::models::Principal;

use crate::AppState;
use crate::error::ApiError;

pub async fn list_rows(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let query = parse_query(parse_resource(&resource)?, &params)?;
    let rows = state.store.query(query).await?;
    Ok(Json(rows))
}

pub async fn get_row(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, Uuid)>,
) -> Result<Json<Value>, ApiError> {
    let resource = parse_resource(&resource)?;
    Ok(Json(state.store.fetch(resource, id).await?))
}

/// Insert a row owned by the caller. The store assigns `id` and
/// `created_at`; the stored row is returned.
pub async fn insert_row(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(resource): Path<String>,
    Json(row): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let resource = parse_resource(&resource)?;

    match owner_of(resource, &row) {
        Some(owner) if owner == principal.id => {}
        Some(owner) => {
            return Err(ApiError::Forbidden(format!(
                "{} may not write {} rows for {}",
                principal.id, resource, owner
            )));
        }
        None => {
            return Err(StoreError::Rejected(format!("{} row is missing its owner", resource)).into());
        }
    }

    let stored = state.store.insert(resource, row).await?;
    info!("{} inserted into {}", principal.id, resource);
    Ok((StatusCode::CREATED, Json(stored)))
}

/// Always toggles for the token subject, whatever `user_id` says.
pub async fn toggle_like(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<ToggleLikeRequest>,
) -> Result<Json<LikeToggle>, ApiError> {
    if let Some(claimed) = req.user_id.filter(|id| *id != principal.id) {
        debug!("Ignoring user_id {} on like toggle by {}", claimed, principal.id);
    }
    let toggle = state.store.toggle_like(principal.id, req.photo_id).await?;
    Ok(Json(toggle))
}

fn parse_resource(raw: &str) -> Result<Resource, ApiError> {
    raw.parse()
        .map_err(|e: slope_types::ParseError| StoreError::NotFound(e.to_string()).into())
}

/// Decode `col=eq.value`, `order=col.dir` and `limit=n` parameters.
fn parse_query(resource: Resource, params: &[(String, String)]) -> Result<wire::Query, ApiError> {
    let mut query = wire::Query::new(resource);
    let mut predicates = Vec::new();

    for (key, value) in params {
        match key.as_str() {
            "order" => query = query.order(value.parse().map_err(bad_request)?),
            "limit" => {
                let limit = value
                    .parse()
                    .map_err(|_| ApiError::BadRequest(format!("invalid limit '{}'", value)))?;
                query = query.limit(limit);
            }
            "access_token" => {}
            _ => predicates.push((key.as_str(), value.as_str())),
        }
    }

    Ok(query.filter(Filter::from_query_pairs(predicates).map_err(bad_request)?))
}

fn bad_request(e: impl std::fmt::Display) -> ApiError {
    ApiError::BadRequest(e.to_string())
}
