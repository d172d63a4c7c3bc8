use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use atrium_api::types::string::{Did, Handle};
use atrium_common::resolver::Resolver;
use atrium_identity::handle::{DnsHandleResolver, DnsTxtResolver, WellKnownHandleResolver};
use atrium_xrpc::http::{header::ACCEPT, Request};
use atrium_xrpc::HttpClient;
use serde::Deserialize;

use super::HandleResolver;
use crate::errors::BoxError;

#[async_trait]
impl<R> HandleResolver for DnsHandleResolver<R>
where
    R: DnsTxtResolver + Send + Sync + 'static,
{
    async fn resolve(&self, handle: &Handle) -> Result<Did, BoxError> {
        Ok(Resolver::resolve(self, handle).await?)
    }
}

#[async_trait]
impl<T> HandleResolver for WellKnownHandleResolver<T>
where
    T: HttpClient + Send + Sync + 'static,
{
    async fn resolve(&self, handle: &Handle) -> Result<Did, BoxError> {
        Ok(Resolver::resolve(self, handle).await?)
    }
}

/// Looks up TXT records through a DNS-over-HTTPS JSON API (`application/dns-json`)
pub struct DohJsonTxtResolver<T> {
    doh_url: String,
    http_client: Arc<T>,
}

impl<T> DohJsonTxtResolver<T> {
    pub fn new(doh_url: &str, http_client: Arc<T>) -> Self {
        Self {
            doh_url: doh_url.trim_end_matches(['?', '/']).to_string(),
            http_client,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    data: String,
}

impl<T> DnsTxtResolver for DohJsonTxtResolver<T>
where
    T: HttpClient + Send + Sync + 'static,
{
    async fn resolve(&self, query: &str) -> Result<Vec<String>, Box<dyn Error + Send + Sync + 'static>> {
        let params = serde_urlencoded::to_string([("name", query), ("type", "TXT")])?;
        let request = Request::builder()
            .uri(format!("{}?{params}", self.doh_url))
            .header(ACCEPT, "application/dns-json")
            .body(Vec::new())?;

        let response = self.http_client.send_http(request).await?;
        if !response.status().is_success() {
            return Err(format!("DoH query failed: HTTP {}", response.status()).into());
        }

        txt_records(serde_json::from_slice(response.body())?)
    }
}

/// The TXT record strings of a DoH answer, with the wire quoting removed
fn txt_records(response: DohResponse) -> Result<Vec<String>, BoxError> {
    // 0 = NOERROR, 3 = NXDOMAIN
    if response.status != 0 {
        return Err(format!("DoH query returned DNS status {}", response.status).into());
    }

    Ok(response
        .answer
        .into_iter()
        .map(|a| a.data.trim().trim_matches('"').to_string())
        .collect())
}
