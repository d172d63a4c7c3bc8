use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::FixtureIdentity;

/// Which handles each lookup method knows about, and which answers are held back.
#[derive(Debug, Clone, Default)]
pub struct HandleHostConfig {
    /// Handles published as `_atproto` TXT records over DNS-over-HTTPS
    pub dns: Vec<FixtureIdentity>,
    /// Handles published at `/.well-known/atproto-did`
    pub well_known: Vec<FixtureIdentity>,
    /// Handles whose answers (from either method) are delayed by `slow_delay`
    pub slow: HashSet<String>,
    pub slow_delay: Duration,
}

#[derive(Clone)]
struct HostState {
    dns: Arc<HashMap<String, String>>,
    well_known: Arc<HashMap<String, String>>,
    slow: Arc<HashSet<String>>,
    slow_delay: Duration,
}

impl HostState {
    async fn maybe_stall(&self, handle: &str) {
        if self.slow.contains(handle) {
            tokio::time::sleep(self.slow_delay).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct DnsQueryParams {
    name: String,
    #[serde(rename = "type")]
    record_type: Option<String>,
}

/// Serves both handle lookup methods from one origin:
///
/// - `GET /dns-query?name=_atproto.<handle>&type=TXT` in DoH JSON format
/// - `GET /:handle/.well-known/atproto-did` as plain text
pub fn router(config: HandleHostConfig) -> Router {
    let by_handle = |identities: Vec<FixtureIdentity>| -> Arc<HashMap<String, String>> {
        Arc::new(
            identities
                .into_iter()
                .map(|identity| (identity.handle, identity.did))
                .collect(),
        )
    };

    let state = HostState {
        dns: by_handle(config.dns),
        well_known: by_handle(config.well_known),
        slow: Arc::new(config.slow),
        slow_delay: config.slow_delay,
    };

    Router::new()
        .route("/dns-query", get(dns_query))
        .route("/:handle/.well-known/atproto-did", get(well_known_did))
        .with_state(state)
}

async fn dns_query(
    State(state): State<HostState>,
    Query(params): Query<DnsQueryParams>,
) -> impl IntoResponse {
    info!(
        "DOH: query for {} ({})",
        params.name,
        params.record_type.as_deref().unwrap_or("A")
    );

    let handle = params
        .name
        .strip_prefix("_atproto.")
        .unwrap_or(&params.name)
        .trim_end_matches('.')
        .to_string();
    state.maybe_stall(&handle).await;

    match state.dns.get(&handle) {
        Some(did) => Json(json!({
            "Status": 0,
            "Question": [{ "name": params.name, "type": 16 }],
            "Answer": [
                { "name": params.name, "type": 16, "TTL": 300, "data": format!("\"did={did}\"") }
            ]
        })),
        // NXDOMAIN
        None => Json(json!({
            "Status": 3,
            "Question": [{ "name": params.name, "type": 16 }]
        })),
    }
}

async fn well_known_did(
    State(state): State<HostState>,
    Path(handle): Path<String>,
) -> impl IntoResponse {
    info!("WELL-KNOWN: atproto-did for {}", handle);
    state.maybe_stall(&handle).await;

    match state.well_known.get(&handle) {
        Some(did) => (StatusCode::OK, did.clone()),
        None => (StatusCode::NOT_FOUND, "not found".to_string()),
    }
}
