//! Identity resolution: handle -> DID -> DID document -> PDS endpoint.
//!
//! Handles are resolved by racing every configured method and taking the
//! first success. DID documents are resolved by exactly one method, picked by
//! the DID's method tag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atrium_api::{
    did_doc::DidDocument,
    types::string::{Did, Handle},
};
use atrium_identity::{
    did::{PlcDidResolver, PlcDidResolverConfig, WebDidResolver, WebDidResolverConfig},
    handle::{
        DnsHandleResolver, DnsHandleResolverConfig, WellKnownHandleResolver,
        WellKnownHandleResolverConfig,
    },
};
use atrium_xrpc::HttpClient;
use futures::stream::{FuturesUnordered, StreamExt as _};
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::errors::{BoxError, MethodFailure, ResolveError};
use crate::identifier::Actor;

pub mod did;
pub mod handle;

pub use handle::DohJsonTxtResolver;

#[async_trait]
pub trait HandleResolver: Send + Sync {
    async fn resolve(&self, handle: &Handle) -> Result<Did, BoxError>;
}

#[async_trait]
pub trait DidDocumentResolver: Send + Sync {
    async fn resolve(&self, did: &Did) -> Result<DidDocument, BoxError>;
}

/// Races several handle resolution methods against each other.
///
/// The first method to succeed wins. Losing methods are dropped as soon as a
/// winner is known, which aborts their in-flight requests.
pub struct CompositeHandleResolver {
    methods: Vec<(&'static str, Arc<dyn HandleResolver>)>,
    timeout: Duration,
}

impl CompositeHandleResolver {
    pub fn race(methods: Vec<(&'static str, Arc<dyn HandleResolver>)>, timeout: Duration) -> Self {
        Self { methods, timeout }
    }

    pub async fn resolve(&self, handle: &Handle) -> Result<Did, ResolveError> {
        let mut pending: FuturesUnordered<_> = self
            .methods
            .iter()
            .map(|(name, method)| {
                let method = Arc::clone(method);
                let timeout = self.timeout;
                async move {
                    let result = match tokio::time::timeout(timeout, method.resolve(handle)).await {
                        Ok(Ok(did)) => Ok(did),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!("timed out after {timeout:?}")),
                    };
                    (*name, result)
                }
            })
            .collect();

        let mut failures = Vec::new();
        while let Some((method, result)) = pending.next().await {
            match result {
                Ok(did) => {
                    debug!(method, handle = handle.as_str(), did = did.as_str(), "Handle resolved");
                    return Ok(did);
                }
                Err(reason) => {
                    debug!(method, handle = handle.as_str(), %reason, "Handle resolution method failed");
                    failures.push(MethodFailure { method, reason });
                }
            }
        }

        Err(ResolveError::HandleResolutionFailed {
            handle: handle.as_str().to_string(),
            failures,
        })
    }
}

/// Dispatches DID document resolution by DID method (`plc`, `web`, ...)
pub struct CompositeDidDocumentResolver {
    methods: HashMap<&'static str, Arc<dyn DidDocumentResolver>>,
    timeout: Duration,
}

impl CompositeDidDocumentResolver {
    pub fn new(
        methods: impl IntoIterator<Item = (&'static str, Arc<dyn DidDocumentResolver>)>,
        timeout: Duration,
    ) -> Self {
        Self {
            methods: methods.into_iter().collect(),
            timeout,
        }
    }

    pub async fn resolve(&self, did: &Did) -> Result<DidDocument, ResolveError> {
        let method_tag = did_method(did);
        let method = self
            .methods
            .get(method_tag)
            .ok_or_else(|| ResolveError::UnsupportedDidMethod(method_tag.to_string()))?;

        let document = match tokio::time::timeout(self.timeout, method.resolve(did)).await {
            Ok(Ok(document)) => document,
            Ok(Err(e)) => {
                return Err(ResolveError::DidDocument {
                    did: did.as_str().to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ResolveError::DidDocument {
                    did: did.as_str().to_string(),
                    reason: format!("timed out after {:?}", self.timeout),
                })
            }
        };

        if document.id != did.as_str() {
            return Err(ResolveError::DidDocument {
                did: did.as_str().to_string(),
                reason: format!("document is for {}", document.id),
            });
        }

        Ok(document)
    }
}

/// The method tag of a DID, e.g. `plc` for `did:plc:abc`
pub fn did_method(did: &Did) -> &str {
    did.as_str().split(':').nth(1).unwrap_or_default()
}

/// Everything needed to start an authorization for one account
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub did: Did,
    /// Only set when the DID document claims the handle back
    pub handle: Option<Handle>,
    pub pds: String,
    pub document: DidDocument,
}

pub struct IdentityResolver {
    handles: CompositeHandleResolver,
    documents: CompositeDidDocumentResolver,
}

impl IdentityResolver {
    pub fn new(handles: CompositeHandleResolver, documents: CompositeDidDocumentResolver) -> Self {
        Self { handles, documents }
    }

    /// The production resolver: DoH + well-known for handles, PLC + web for DIDs
    pub fn from_config<T>(config: &AuthConfig, http_client: Arc<T>) -> Self
    where
        T: HttpClient + Send + Sync + 'static,
    {
        let dns = DnsHandleResolver::new(DnsHandleResolverConfig {
            dns_txt_resolver: DohJsonTxtResolver::new(&config.doh_url, Arc::clone(&http_client)),
        });
        let well_known = WellKnownHandleResolver::new(WellKnownHandleResolverConfig {
            http_client: Arc::clone(&http_client),
        });
        let handles = CompositeHandleResolver::race(
            vec![
                ("dns", Arc::new(dns) as Arc<dyn HandleResolver>),
                ("http", Arc::new(well_known)),
            ],
            config.resolver_timeout,
        );

        let plc = PlcDidResolver::new(PlcDidResolverConfig {
            plc_directory_url: config.plc_directory_url.clone(),
            http_client: Arc::clone(&http_client),
        });
        let web = WebDidResolver::new(WebDidResolverConfig { http_client });
        let documents = CompositeDidDocumentResolver::new(
            [
                ("plc", Arc::new(plc) as Arc<dyn DidDocumentResolver>),
                ("web", Arc::new(web)),
            ],
            config.resolver_timeout,
        );

        Self::new(handles, documents)
    }

    pub async fn resolve_handle(&self, handle: &Handle) -> Result<Did, ResolveError> {
        self.handles.resolve(handle).await
    }

    pub async fn resolve_document(&self, did: &Did) -> Result<DidDocument, ResolveError> {
        self.documents.resolve(did).await
    }

    /// Resolve a handle or DID all the way to its PDS
    #[tracing::instrument(skip(self), err)]
    pub async fn resolve(&self, actor: &str) -> Result<ResolvedIdentity, ResolveError> {
        let actor = Actor::parse(actor).ok_or_else(|| ResolveError::InvalidActor(actor.to_string()))?;

        let (did, claimed_handle) = match actor {
            Actor::Did(did) => (did, None),
            Actor::Handle(handle) => {
                let handle = normalize_handle(handle);
                (self.resolve_handle(&handle).await?, Some(handle))
            }
        };

        let document = self.resolve_document(&did).await?;
        let pds = pds_endpoint(&document)
            .ok_or_else(|| ResolveError::MissingPdsEndpoint(did.as_str().to_string()))?;

        let handle = match claimed_handle {
            Some(handle) if document_claims_handle(&document, &handle) => Some(handle),
            Some(handle) => {
                warn!(
                    did = did.as_str(),
                    handle = handle.as_str(),
                    "DID document does not claim handle, treating it as invalid"
                );
                None
            }
            None => document_handle(&document),
        };

        info!(did = did.as_str(), pds = %pds, "Resolved identity");
        Ok(ResolvedIdentity {
            did,
            handle,
            pds,
            document,
        })
    }
}

fn normalize_handle(handle: Handle) -> Handle {
    let lower = handle.as_str().to_ascii_lowercase();
    Handle::new(lower).unwrap_or(handle)
}

/// The `#atproto_pds` service endpoint of a DID document
pub fn pds_endpoint(document: &DidDocument) -> Option<String> {
    document
        .service
        .as_ref()?
        .iter()
        .find(|s| s.id.ends_with("#atproto_pds") && s.r#type == "AtprotoPersonalDataServer")
        .map(|s| s.service_endpoint.trim_end_matches('/').to_string())
}

fn document_claims_handle(document: &DidDocument, handle: &Handle) -> bool {
    document_handle(document).is_some_and(|claimed| claimed.as_str() == handle.as_str())
}

/// The first `at://` alias in `alsoKnownAs`, if it is a valid handle
fn document_handle(document: &DidDocument) -> Option<Handle> {
    document
        .also_known_as
        .as_ref()?
        .iter()
        .find_map(|aka| aka.strip_prefix("at://"))
        .and_then(|handle| Handle::new(handle.to_ascii_lowercase()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixed(Result<&'static str, &'static str>);

    #[async_trait]
    impl HandleResolver for Fixed {
        async fn resolve(&self, _: &Handle) -> Result<Did, BoxError> {
            match self.0 {
                Ok(did) => Ok(Did::new(did.to_string())?),
                Err(reason) => Err(reason.into()),
            }
        }
    }

    /// Never answers; records whether its future was dropped.
    struct Hanging(Arc<AtomicBool>);

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl HandleResolver for Hanging {
        async fn resolve(&self, _: &Handle) -> Result<Did, BoxError> {
            let _guard = SetOnDrop(Arc::clone(&self.0));
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn handle(h: &str) -> Handle {
        Handle::new(h.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_race_takes_first_success_and_abandons_the_rest() {
        let dropped = Arc::new(AtomicBool::new(false));
        let resolver = CompositeHandleResolver::race(
            vec![
                ("slow", Arc::new(Hanging(Arc::clone(&dropped))) as Arc<dyn HandleResolver>),
                ("fast", Arc::new(Fixed(Ok("did:plc:alice")))),
            ],
            Duration::from_secs(5),
        );

        let did = resolver.resolve(&handle("alice.test")).await.unwrap();

        assert_eq!(did.as_str(), "did:plc:alice");
        assert!(dropped.load(Ordering::SeqCst), "losing method should be dropped");
    }

    #[tokio::test]
    async fn test_race_falls_through_failures() {
        let resolver = CompositeHandleResolver::race(
            vec![
                ("dns", Arc::new(Fixed(Err("NXDOMAIN"))) as Arc<dyn HandleResolver>),
                ("http", Arc::new(Fixed(Ok("did:plc:alice")))),
            ],
            Duration::from_secs(5),
        );

        let did = resolver.resolve(&handle("alice.test")).await.unwrap();
        assert_eq!(did.as_str(), "did:plc:alice");
    }

    #[tokio::test]
    async fn test_race_reports_every_failure() {
        let resolver = CompositeHandleResolver::race(
            vec![
                ("dns", Arc::new(Fixed(Err("NXDOMAIN"))) as Arc<dyn HandleResolver>),
                ("http", Arc::new(Fixed(Err("HTTP 404")))),
            ],
            Duration::from_secs(5),
        );

        let err = resolver.resolve(&handle("alice.test")).await.unwrap_err();
        let ResolveError::HandleResolutionFailed { handle, mut failures } = err else {
            panic!("expected HandleResolutionFailed, got {err:?}");
        };
        failures.sort_by_key(|f| f.method);

        assert_eq!(handle, "alice.test");
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].method, "dns");
        assert_eq!(failures[0].reason, "NXDOMAIN");
        assert_eq!(failures[1].method, "http");
    }

    #[tokio::test]
    async fn test_race_method_timeout_counts_as_failure() {
        let resolver = CompositeHandleResolver::race(
            vec![(
                "slow",
                Arc::new(Hanging(Arc::new(AtomicBool::new(false)))) as Arc<dyn HandleResolver>,
            )],
            Duration::from_millis(20),
        );

        let err = resolver.resolve(&handle("alice.test")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    struct StaticDocument(DidDocument);

    #[async_trait]
    impl DidDocumentResolver for StaticDocument {
        async fn resolve(&self, _: &Did) -> Result<DidDocument, BoxError> {
            Ok(self.0.clone())
        }
    }

    fn document(did: &str, handle: &str, pds: &str) -> DidDocument {
        serde_json::from_value(serde_json::json!({
            "@context": ["https://w3id.org/did/v1"],
            "id": did,
            "alsoKnownAs": [format!("at://{handle}")],
            "verificationMethod": [],
            "service": [{
                "id": "#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": pds
            }]
        }))
        .unwrap()
    }

    fn resolver_with(handle_did: &'static str, doc: DidDocument) -> IdentityResolver {
        IdentityResolver::new(
            CompositeHandleResolver::race(
                vec![("dns", Arc::new(Fixed(Ok(handle_did))) as Arc<dyn HandleResolver>)],
                Duration::from_secs(5),
            ),
            CompositeDidDocumentResolver::new(
                [("plc", Arc::new(StaticDocument(doc)) as Arc<dyn DidDocumentResolver>)],
                Duration::from_secs(5),
            ),
        )
    }

    #[tokio::test]
    async fn test_dispatch_rejects_unknown_did_methods() {
        let resolver = resolver_with(
            "did:plc:alice",
            document("did:plc:alice", "alice.test", "https://pds.test"),
        );

        let err = resolver
            .resolve_document(&Did::new("did:key:z6Mkabc".to_string()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedDidMethod(ref m) if m == "key"));
    }

    #[tokio::test]
    async fn test_resolve_handle_to_pds() {
        let resolver = resolver_with(
            "did:plc:alice",
            document("did:plc:alice", "alice.test", "https://pds.test/"),
        );

        let identity = resolver.resolve("Alice.Test").await.unwrap();

        assert_eq!(identity.did.as_str(), "did:plc:alice");
        assert_eq!(identity.handle.unwrap().as_str(), "alice.test");
        assert_eq!(identity.pds, "https://pds.test");
    }

    #[tokio::test]
    async fn test_unclaimed_handle_is_dropped() {
        let resolver = resolver_with(
            "did:plc:alice",
            document("did:plc:alice", "someone-else.test", "https://pds.test"),
        );

        let identity = resolver.resolve("alice.test").await.unwrap();
        assert_eq!(identity.did.as_str(), "did:plc:alice");
        assert!(identity.handle.is_none());
    }

    #[tokio::test]
    async fn test_document_for_wrong_did_is_rejected() {
        let resolver = resolver_with(
            "did:plc:alice",
            document("did:plc:mallory", "alice.test", "https://pds.test"),
        );

        let err = resolver.resolve("did:plc:alice").await.unwrap_err();
        assert!(matches!(err, ResolveError::DidDocument { .. }));
    }

    #[tokio::test]
    async fn test_invalid_actor() {
        let resolver = resolver_with(
            "did:plc:alice",
            document("did:plc:alice", "alice.test", "https://pds.test"),
        );

        let err = resolver.resolve("not a handle").await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidActor(_)));
    }
}
