use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::FixtureIdentity;

#[derive(Clone, Default)]
struct PlcState {
    identities: Arc<HashMap<String, FixtureIdentity>>,
}

/// PLC directory: `GET /:did` returns the DID document for a known `did:plc`
pub fn router(identities: Vec<FixtureIdentity>) -> Router {
    let state = PlcState {
        identities: Arc::new(
            identities
                .into_iter()
                .map(|identity| (identity.did.clone(), identity))
                .collect(),
        ),
    };

    Router::new()
        .route("/", get(|| async { "PLC Directory Fixture Server" }))
        .route("/:did", get(resolve_did))
        .with_state(state)
}

async fn resolve_did(State(state): State<PlcState>, Path(did): Path<String>) -> impl IntoResponse {
    info!("PLC DIRECTORY: Resolving DID: {}", did);

    match state.identities.get(&did) {
        Some(identity) => (StatusCode::OK, Json(identity.did_document())),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": format!("DID not registered: {did}") })),
        ),
    }
}
