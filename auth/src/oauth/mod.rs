//! The boundary to the OAuth agent.
//!
//! The protocol itself (PAR, PKCE, DPoP, token refresh) lives behind
//! [`OAuthProvider`]; this crate only decides *when* to call it and what to
//! do with the credentials it hands back.

use std::sync::Arc;

use async_trait::async_trait;
use atrium_api::types::string::Did;
use atrium_xrpc::http::{Request, Response};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::OAuthClientSettings;
use crate::errors::BoxError;
use crate::identifier::AuthorizationTarget;
use crate::resolver::IdentityResolver;

pub mod agent;

pub use agent::UserAgent;

/// An authorized credential for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthSession {
    /// The account the credential was issued for (`sub`)
    pub did: Did,
    /// The PDS the credential is valid against (`aud`)
    pub pds: String,
    pub scope: String,
    /// When the current access token expires, if known
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthSession {
    /// Stale sessions are still usable; the agent refreshes them on first use
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at < Utc::now())
    }
}

/// Everything the agent needs before it can authorize or restore sessions
#[derive(Clone)]
pub struct OAuthSetup {
    pub client: OAuthClientSettings,
    pub resolver: Arc<IdentityResolver>,
}

/// Parameters of a redirect back from the authorization server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    pub state: String,
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub iss: Option<String>,
}

#[derive(Deserialize)]
struct RawCallbackParams {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    iss: Option<String>,
}

impl CallbackParams {
    /// Parse a URL fragment (with or without the leading `#`).
    ///
    /// Returns `None` unless `state` and one of `code` / `error` are present,
    /// meaning the page load is not an authorization callback.
    pub fn from_fragment(fragment: &str) -> Option<Self> {
        let fragment = fragment.strip_prefix('#').unwrap_or(fragment);
        let raw: RawCallbackParams = serde_urlencoded::from_str(fragment).ok()?;

        let state = raw.state?;
        if raw.code.is_none() && raw.error.is_none() {
            return None;
        }

        Some(Self {
            state,
            code: raw.code,
            error: raw.error,
            error_description: raw.error_description,
            iss: raw.iss,
        })
    }
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Called once per registry initialization, before any other method
    fn configure(&self, setup: OAuthSetup);

    /// Build the URL to send the user to for `target`.
    ///
    /// Failures to resolve the account (via [`OAuthSetup::resolver`]) should
    /// come back as a boxed [`ResolveError`](crate::errors::ResolveError).
    async fn authorization_url(
        &self,
        target: &AuthorizationTarget,
        scope: &str,
    ) -> Result<Url, BoxError>;

    /// Exchange a callback's code for a credential
    async fn finalize_authorization(&self, params: &CallbackParams)
        -> Result<OAuthSession, BoxError>;

    /// Load the stored credential for `did`. With `allow_stale`, an expired
    /// credential is returned as-is instead of being refreshed eagerly.
    async fn restore_session(&self, did: &Did, allow_stale: bool)
        -> Result<OAuthSession, BoxError>;

    /// Drop whatever the agent has stored for `did`
    async fn delete_stored_session(&self, did: &Did) -> Result<(), BoxError>;

    /// Revoke the credential with the authorization server
    async fn revoke(&self, session: &OAuthSession) -> Result<(), BoxError>;

    /// Send an HTTP request on behalf of `session`, adding its authorization
    /// (and refreshing the token first when needed)
    async fn send(
        &self,
        session: &OAuthSession,
        request: Request<Vec<u8>>,
    ) -> Result<Response<Vec<u8>>, BoxError>;
}
