use async_trait::async_trait;
use atrium_api::{did_doc::DidDocument, types::string::Did};
use atrium_common::resolver::Resolver;
use atrium_identity::did::{PlcDidResolver, WebDidResolver};
use atrium_xrpc::HttpClient;

use super::DidDocumentResolver;
use crate::errors::BoxError;

#[async_trait]
impl<T> DidDocumentResolver for PlcDidResolver<T>
where
    T: HttpClient + Send + Sync + 'static,
{
    async fn resolve(&self, did: &Did) -> Result<DidDocument, BoxError> {
        Ok(Resolver::resolve(self, did).await?)
    }
}

#[async_trait]
impl<T> DidDocumentResolver for WebDidResolver<T>
where
    T: HttpClient + Send + Sync + 'static,
{
    async fn resolve(&self, did: &Did) -> Result<DidDocument, BoxError> {
        reject_path_based(did)?;
        Ok(Resolver::resolve(self, did).await?)
    }
}

/// Path-based `did:web` identifiers are not valid atproto identities
fn reject_path_based(did: &Did) -> Result<(), BoxError> {
    let host = did.as_str().strip_prefix("did:web:").unwrap_or_default();
    if host.contains(':') {
        return Err(format!("path-based did:web is not supported: {}", did.as_str()).into());
    }
    Ok(())
}
