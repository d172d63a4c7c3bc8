use std::sync::{Arc, PoisonError, RwLock};

use atrium_api::agent::{CloneWithProxy, Configure, SessionManager};
use atrium_api::types::string::Did;
use atrium_xrpc::http::{Request, Response};
use atrium_xrpc::{HttpClient, XrpcClient};

use super::{OAuthProvider, OAuthSession};
use crate::errors::BoxError;

/// One account's credential bound to the agent that can use it.
///
/// Requests go out through [`OAuthProvider::send`], which signs them for the
/// session. The endpoint starts as the session's PDS and the proxy header is
/// unset until configured.
pub struct UserAgent {
    provider: Arc<dyn OAuthProvider>,
    session: OAuthSession,
    endpoint: RwLock<String>,
    proxy_header: RwLock<Option<String>>,
    labelers_header: RwLock<Option<Vec<String>>>,
}

impl UserAgent {
    pub fn new(provider: Arc<dyn OAuthProvider>, session: OAuthSession) -> Self {
        let endpoint = RwLock::new(session.pds.clone());
        Self {
            provider,
            session,
            endpoint,
            proxy_header: RwLock::new(None),
            labelers_header: RwLock::new(None),
        }
    }

    pub fn did(&self) -> &Did {
        &self.session.did
    }

    pub fn session(&self) -> &OAuthSession {
        &self.session
    }

    /// Revoke this credential with the authorization server
    pub async fn sign_out(&self) -> Result<(), BoxError> {
        self.provider.revoke(&self.session).await
    }
}

impl Clone for UserAgent {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            session: self.session.clone(),
            endpoint: RwLock::new(read(&self.endpoint)),
            proxy_header: RwLock::new(read(&self.proxy_header)),
            labelers_header: RwLock::new(read(&self.labelers_header)),
        }
    }
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
}

impl HttpClient for UserAgent {
    async fn send_http(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, BoxError> {
        self.provider.send(&self.session, request).await
    }
}

impl XrpcClient for UserAgent {
    fn base_uri(&self) -> String {
        read(&self.endpoint)
    }

    async fn atproto_proxy_header(&self) -> Option<String> {
        read(&self.proxy_header)
    }

    async fn atproto_accept_labelers_header(&self) -> Option<Vec<String>> {
        read(&self.labelers_header)
    }
}

impl SessionManager for UserAgent {
    async fn did(&self) -> Option<Did> {
        Some(self.session.did.clone())
    }
}

impl Configure for UserAgent {
    fn configure_endpoint(&self, endpoint: String) {
        write(&self.endpoint, endpoint);
    }

    fn configure_labelers_header(&self, labeler_dids: Option<Vec<(Did, bool)>>) {
        let header = labeler_dids.map(|dids| {
            dids.into_iter()
                .map(|(did, redact)| {
                    if redact {
                        format!("{};redact", did.as_str())
                    } else {
                        did.as_str().to_string()
                    }
                })
                .collect()
        });
        write(&self.labelers_header, header);
    }

    fn configure_proxy_header(&self, did: Did, service_type: impl AsRef<str>) {
        let header = format!("{}#{}", did.as_str(), service_type.as_ref());
        write(&self.proxy_header, Some(header));
    }
}

impl CloneWithProxy for UserAgent {
    fn clone_with_proxy(&self, did: Did, service_type: impl AsRef<str>) -> Self {
        let cloned = self.clone();
        cloned.configure_proxy_header(did, service_type);
        cloned
    }
}
