#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use atrium_api::types::string::Did;
use atrium_xrpc::http::{HeaderMap, Method, Request, Response};
use atrium_xrpc_client::reqwest::ReqwestClient;
use gifdex_auth::errors::{BoxError, StoreError};
use gifdex_auth::oauth::OAuthSetup;
use gifdex_auth::user::GET_PROFILE_NSID;
use gifdex_auth::{
    AuthConfig, AuthorizationTarget, CallbackParams, Client, IdentityResolver, KeyValueStore,
    MemoryStore, Navigator, OAuthProvider, OAuthSession, ResolveError, SessionRegistry,
    SessionStore, UserSession,
};
use reqwest::Url;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

pub fn did(s: &str) -> Did {
    Did::new(s.to_string()).unwrap()
}

pub fn session_for(did_str: &str) -> OAuthSession {
    OAuthSession {
        did: did(did_str),
        pds: "https://pds.test".to_string(),
        scope: "atproto transition:generic".to_string(),
        expires_at: None,
    }
}

/// `did:plc:alice` -> `alice.test`
pub fn handle_for(did: &str) -> String {
    format!("{}.test", did.rsplit(':').next().unwrap_or(did))
}

/// CID handed back for every record write
pub const RECORD_CID: &str = "bafyreidhrot5xz4lm22k45ijx4few2t2a6rgmm45zkctyjuvxapptnva3a";

/// An XRPC call as the agent was asked to send it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub nsid: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

impl RecordedRequest {
    fn from_http(request: &Request<Vec<u8>>) -> Self {
        let uri = request.uri();
        Self {
            method: request.method().clone(),
            nsid: uri.path().trim_start_matches("/xrpc/").to_string(),
            query: serde_urlencoded::from_str(uri.query().unwrap_or_default()).unwrap(),
            headers: request.headers().clone(),
            body: serde_json::from_slice(request.body()).ok(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }
}

fn json_response(status: u16, body: Value) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(serde_json::to_vec(&body).unwrap())
        .unwrap()
}

fn error_response(status: u16, error: &str, message: &str) -> Response<Vec<u8>> {
    json_response(status, json!({ "error": error, "message": message }))
}

/// A scripted OAuth agent that keeps everything in memory
#[derive(Default)]
pub struct FakeProvider {
    pub configured: Mutex<Option<OAuthSetup>>,
    pub stored: Mutex<HashMap<String, OAuthSession>>,
    pub exchange_codes: Mutex<HashMap<String, OAuthSession>>,
    pub targets: Mutex<Vec<(AuthorizationTarget, String)>>,
    pub exchanges: AtomicUsize,
    pub restores: AtomicUsize,
    pub revoked: Mutex<Vec<Did>>,
    pub deleted: Mutex<Vec<Did>>,
    pub requests: Mutex<Vec<(Did, RecordedRequest)>>,
    /// Repo records by DID
    pub records: Mutex<HashMap<String, Value>>,
    /// When set, each restore consumes a permit
    pub restore_gate: Option<Arc<Semaphore>>,
    /// When set, each profile request consumes a permit
    pub profile_gate: Option<Arc<Semaphore>>,
    /// DIDs whose restore never completes
    pub hanging_restores: HashSet<String>,
    pub fail_profiles: AtomicBool,
    pub fail_revoke: AtomicBool,
    /// Authorization fails as if no identity method could resolve the account
    pub unresolvable: AtomicBool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the agent has a stored credential for `did`
    pub fn store_session(&self, did: &str) {
        self.stored
            .lock()
            .unwrap()
            .insert(did.to_string(), session_for(did));
    }

    pub fn expect_code(&self, code: &str, did: &str) {
        self.exchange_codes
            .lock()
            .unwrap()
            .insert(code.to_string(), session_for(did));
    }

    pub fn revoked(&self) -> Vec<Did> {
        self.revoked.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<Did> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn requests_for(&self, nsid: &str) -> Vec<(Did, RecordedRequest)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, request)| request.nsid == nsid)
            .cloned()
            .collect()
    }

    fn profile_response(&self, actor: &str) -> Response<Vec<u8>> {
        if self.fail_profiles.load(Ordering::SeqCst) {
            return error_response(502, "UpstreamFailure", "appview unavailable");
        }

        let display_name = self
            .records
            .lock()
            .unwrap()
            .get(actor)
            .and_then(|record| record["displayName"].as_str().map(str::to_string));

        json_response(200, json!({
            "did": actor,
            "handle": handle_for(actor),
            "displayName": display_name,
        }))
    }
}

#[async_trait]
impl OAuthProvider for FakeProvider {
    fn configure(&self, setup: OAuthSetup) {
        *self.configured.lock().unwrap() = Some(setup);
    }

    async fn authorization_url(
        &self,
        target: &AuthorizationTarget,
        scope: &str,
    ) -> Result<Url, BoxError> {
        self.targets
            .lock()
            .unwrap()
            .push((target.clone(), scope.to_string()));
        if self.unresolvable.load(Ordering::SeqCst) {
            let handle = match target {
                AuthorizationTarget::Account { identifier } => identifier.clone(),
                AuthorizationTarget::Pds { service_url } => service_url.clone(),
            };
            return Err(Box::new(ResolveError::HandleResolutionFailed {
                handle,
                failures: vec![],
            }));
        }
        Ok(Url::parse("https://auth.test/oauth/authorize?request_uri=urn%3Atest")?)
    }

    async fn finalize_authorization(
        &self,
        params: &CallbackParams,
    ) -> Result<OAuthSession, BoxError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = &params.error {
            return Err(format!("authorization server returned {error}").into());
        }
        let code = params.code.as_deref().unwrap_or_default();
        let session = self
            .exchange_codes
            .lock()
            .unwrap()
            .remove(code)
            .ok_or("unknown authorization code")?;

        self.stored
            .lock()
            .unwrap()
            .insert(session.did.as_str().to_string(), session.clone());
        Ok(session)
    }

    async fn restore_session(&self, did: &Did, allow_stale: bool) -> Result<OAuthSession, BoxError> {
        assert!(allow_stale, "restores should accept stale sessions");
        self.restores.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.restore_gate {
            gate.acquire().await?.forget();
        }
        if self.hanging_restores.contains(did.as_str()) {
            std::future::pending::<()>().await;
        }

        let session = self.stored.lock().unwrap().get(did.as_str()).cloned();
        session.ok_or_else(|| format!("no stored session for {}", did.as_str()).into())
    }

    async fn delete_stored_session(&self, did: &Did) -> Result<(), BoxError> {
        self.stored.lock().unwrap().remove(did.as_str());
        self.deleted.lock().unwrap().push(did.clone());
        Ok(())
    }

    async fn revoke(&self, session: &OAuthSession) -> Result<(), BoxError> {
        if self.fail_revoke.load(Ordering::SeqCst) {
            return Err("revocation endpoint unavailable".into());
        }
        self.revoked.lock().unwrap().push(session.did.clone());
        Ok(())
    }

    async fn send(
        &self,
        session: &OAuthSession,
        request: Request<Vec<u8>>,
    ) -> Result<Response<Vec<u8>>, BoxError> {
        let request = RecordedRequest::from_http(&request);
        self.requests
            .lock()
            .unwrap()
            .push((session.did.clone(), request.clone()));

        match request.nsid.as_str() {
            GET_PROFILE_NSID => {
                if let Some(gate) = &self.profile_gate {
                    gate.acquire().await?.forget();
                }
                let actor = request.query_param("actor").unwrap_or_default();
                Ok(self.profile_response(&actor))
            }
            "com.atproto.repo.getRecord" => {
                let repo = request.query_param("repo").unwrap_or_default();
                Ok(match self.records.lock().unwrap().get(&repo) {
                    Some(record) => json_response(
                        200,
                        json!({
                            "uri": format!("at://{repo}/net.gifdex.actor.profile/self"),
                            "value": record,
                        }),
                    ),
                    None => error_response(400, "RecordNotFound", "Could not locate record"),
                })
            }
            "com.atproto.repo.putRecord" => {
                let body = request.body.unwrap_or_default();
                let repo = body["repo"].as_str().unwrap_or_default().to_string();
                self.records
                    .lock()
                    .unwrap()
                    .insert(repo.clone(), body["record"].clone());
                Ok(json_response(
                    200,
                    json!({
                        "uri": format!("at://{repo}/net.gifdex.actor.profile/self"),
                        "cid": RECORD_CID,
                    }),
                ))
            }
            _ => Ok(json_response(200, json!({}))),
        }
    }
}

/// Durable storage whose writes start failing on demand
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    pub fail_writes: AtomicBool,
}

impl FailingStore {
    fn check(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}

impl KeyValueStore for FailingStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.remove(key)
    }
}

pub struct RecordingNavigator {
    pub location: String,
    pub assigned: Mutex<Vec<Url>>,
    pub cleared: AtomicUsize,
}

impl RecordingNavigator {
    pub fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            assigned: Mutex::new(vec![]),
            cleared: AtomicUsize::new(0),
        }
    }
}

impl Navigator for RecordingNavigator {
    fn current_location(&self) -> String {
        self.location.clone()
    }

    fn assign(&self, url: &Url) {
        self.assigned.lock().unwrap().push(url.clone());
    }

    fn clear_fragment(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

pub const LOCATION: &str = "https://gifdex.net/gifs/trending";

pub struct Harness {
    pub registry: Arc<SessionRegistry>,
    pub provider: Arc<FakeProvider>,
    pub store: SessionStore,
    pub navigator: Arc<RecordingNavigator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provider(FakeProvider::new())
    }

    pub fn with_provider(provider: FakeProvider) -> Self {
        Self::build(provider, test_config(&[]))
    }

    pub fn with_store(store: SessionStore) -> Self {
        Self::build_with_store(FakeProvider::new(), test_config(&[]), store)
    }

    pub fn build(provider: FakeProvider, config: AuthConfig) -> Self {
        Self::build_with_store(provider, config, SessionStore::in_memory())
    }

    pub fn build_with_store(provider: FakeProvider, config: AuthConfig, store: SessionStore) -> Self {
        let provider = Arc::new(provider);
        let navigator = Arc::new(RecordingNavigator::new(LOCATION));

        let resolver = Arc::new(IdentityResolver::from_config(
            &config,
            Arc::new(ReqwestClient::new(&config.plc_directory_url)),
        ));
        let unauthenticated = Client::unauthenticated(reqwest::Client::new(), &config.appview.url);
        let registry = Arc::new(SessionRegistry::from_parts(
            config,
            provider.clone(),
            resolver,
            store.clone(),
            navigator.clone(),
            unauthenticated,
        ));

        Self {
            registry,
            provider,
            store,
            navigator,
        }
    }

    /// Persist `dids` as previously signed in, with agent credentials for `restorable`
    pub fn seed(&self, dids: &[&str], restorable: &[&str], active: Option<&str>) {
        let dids: Vec<Did> = dids.iter().map(|d| did(d)).collect();
        self.store.set_stored_dids(&dids).unwrap();
        self.store
            .set_active_user(active.map(did).as_ref())
            .unwrap();
        for d in restorable {
            self.provider.store_session(d);
        }
    }

    /// Sign `did` in through the callback path
    pub async fn sign_in(&self, did_str: &str) {
        let code = format!("code-{}", handle_for(did_str));
        self.provider.expect_code(&code, did_str);
        let outcome = self
            .registry
            .finalize_callback(&format!("state=s&code={code}"))
            .await;
        assert!(outcome.success(), "sign-in of {did_str} failed: {outcome:?}");
    }
}

pub fn test_config(vars: &[(&str, &str)]) -> AuthConfig {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    AuthConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

/// Wait until no profile fetch is in flight
pub async fn profile_settled(user: &UserSession) {
    let mut rx = user.subscribe_profile();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| !state.is_loading))
        .await
        .expect("profile fetch never finished")
        .unwrap();
}
