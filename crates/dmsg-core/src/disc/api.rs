//! Discovery HTTP API
//!
//! Serves a [`MemoryDiscovery`] over the routes [`super::HttpDiscovery`]
//! consumes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use dmsg_protocol::PubKey;

use super::{Discovery, Entry, MemoryDiscovery};
use crate::error::{DiscoveryError, DmsgError};

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<DiscoveryError> for ApiError {
    fn from(err: DiscoveryError) -> Self {
        let status = match &err {
            DiscoveryError::Entry(DmsgError::DiscEntryNotFound) => StatusCode::NOT_FOUND,
            DiscoveryError::Validation(_) | DiscoveryError::Entry(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

fn parse_pk(raw: &str) -> Result<PubKey, ApiError> {
    raw.parse()
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("invalid public key: {}", e)))
}

async fn get_entry(
    State(store): State<Arc<MemoryDiscovery>>,
    Path(pk): Path<String>,
) -> Result<Json<Entry>, ApiError> {
    let pk = parse_pk(&pk)?;
    Ok(Json(store.entry(&pk).await?))
}

async fn post_entry(
    State(store): State<Arc<MemoryDiscovery>>,
    Path(pk): Path<String>,
    Json(entry): Json<Entry>,
) -> Result<StatusCode, ApiError> {
    let pk = parse_pk(&pk)?;
    if pk != entry.static_pk {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            "path key does not match entry key".to_string(),
        ));
    }
    store.post_entry(&entry).await?;
    Ok(StatusCode::OK)
}

async fn client_entries(
    State(store): State<Arc<MemoryDiscovery>>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    Ok(Json(store.client_entries().await?))
}

async fn available_servers(
    State(store): State<Arc<MemoryDiscovery>>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    Ok(Json(store.available_servers().await?))
}

/// Router exposing `store` as a discovery service
pub fn router(store: Arc<MemoryDiscovery>) -> Router {
    Router::new()
        .route("/discovery/entries/:pk", get(get_entry).post(post_entry))
        .route("/dmsg-discovery/entries", get(client_entries))
        .route("/dmsg-discovery/available_servers", get(available_servers))
        .with_state(store)
}
