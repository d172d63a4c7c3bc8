use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::FixtureIdentity;

#[derive(Clone, Default)]
struct AppViewState {
    identities: Arc<HashMap<String, FixtureIdentity>>,
}

#[derive(Debug, Deserialize)]
struct GetProfileParams {
    actor: String,
}

/// AppView serving `net.gifdex.actor.getProfile` for the given identities
pub fn router(identities: Vec<FixtureIdentity>) -> Router {
    let state = AppViewState {
        identities: Arc::new(
            identities
                .into_iter()
                .map(|identity| (identity.did.clone(), identity))
                .collect(),
        ),
    };

    Router::new()
        .route("/xrpc/net.gifdex.actor.getProfile", get(get_profile))
        .with_state(state)
}

async fn get_profile(
    State(state): State<AppViewState>,
    headers: HeaderMap,
    Query(params): Query<GetProfileParams>,
) -> impl IntoResponse {
    info!(
        "APPVIEW: getProfile for {} (proxy: {:?})",
        params.actor,
        headers.get("atproto-proxy")
    );

    let identity = state
        .identities
        .get(&params.actor)
        .or_else(|| state.identities.values().find(|i| i.handle == params.actor));

    match identity {
        Some(identity) => (
            StatusCode::OK,
            Json(json!({
                "did": identity.did,
                "handle": identity.handle,
                "displayName": identity.display_name,
                "indexedAt": "2025-03-14T12:00:00.000Z"
            })),
        ),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "InvalidRequest",
                "message": format!("Profile not found: {}", params.actor)
            })),
        ),
    }
}
