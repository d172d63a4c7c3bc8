//! The session registry: who is signed in, and who is active.
//!
//! [`SessionRegistry`] is the only thing allowed to add, remove or re-point
//! the active account. Its state is published as a [`RegistrySnapshot`]
//! through a watch channel; every committed change bumps the snapshot's
//! `version`, and views holding a client for the previous account are
//! expected to rebuild from the new snapshot.

use std::future::Future;
use std::sync::Arc;

use atrium_api::types::string::Did;
use atrium_xrpc_client::reqwest::ReqwestClientBuilder;
use futures::future::join_all;
use reqwest::Url;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::client::Client;
use crate::config::AuthConfig;
use crate::errors::{AuthError, BoxError, ResolveError};
use crate::identifier::{classify_identifier, AuthorizationTarget, IdentifierKind};
use crate::oauth::{CallbackParams, OAuthProvider, OAuthSession, OAuthSetup};
use crate::resolver::IdentityResolver;
use crate::store::SessionStore;
use crate::user::UserSession;

/// Where the application is, and how to leave it for the authorization server
pub trait Navigator: Send + Sync {
    /// The location to come back to after authorization
    fn current_location(&self) -> String;

    /// Leave the application for `url`
    fn assign(&self, url: &Url);

    /// Remove the consumed callback parameters from the visible location
    fn clear_fragment(&self) {}
}

/// For processes with no browser: logs the authorization URL for the user to open
pub struct HeadlessNavigator {
    location: String,
}

impl HeadlessNavigator {
    pub fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
        }
    }
}

impl Navigator for HeadlessNavigator {
    fn current_location(&self) -> String {
        self.location.clone()
    }

    fn assign(&self, url: &Url) {
        info!(%url, "Open this URL to finish signing in");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryStatus {
    Uninitialized,
    Restoring,
    Ready,
    Disposed,
}

/// An immutable view of the registry at one version
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub status: RegistryStatus,
    pub version: u64,
    sessions: Vec<Arc<UserSession>>,
    active: Option<Did>,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            status: RegistryStatus::Uninitialized,
            version: 0,
            sessions: vec![],
            active: None,
        }
    }

    /// Signed-in accounts, oldest first
    pub fn sessions(&self) -> &[Arc<UserSession>] {
        &self.sessions
    }

    pub fn dids(&self) -> Vec<Did> {
        self.sessions.iter().map(|s| s.did().clone()).collect()
    }

    pub fn get(&self, did: &Did) -> Option<&Arc<UserSession>> {
        self.sessions.iter().find(|s| s.did() == did)
    }

    pub fn contains(&self, did: &Did) -> bool {
        self.get(did).is_some()
    }

    pub fn active_did(&self) -> Option<&Did> {
        self.active.as_ref()
    }

    pub fn active_session(&self) -> Option<&Arc<UserSession>> {
        self.active.as_ref().and_then(|did| self.get(did))
    }

    /// Add or replace the session for its DID
    fn insert(&mut self, session: Arc<UserSession>) {
        match self.sessions.iter_mut().find(|s| s.did() == session.did()) {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
    }

    fn remove(&mut self, did: &Did) {
        self.sessions.retain(|s| s.did() != did);
    }

    fn first_other_than(&self, did: &Did) -> Option<Did> {
        self.sessions
            .iter()
            .map(|s| s.did())
            .find(|other| *other != did)
            .cloned()
    }
}

#[derive(Debug, Clone)]
pub enum AuthState {
    Unauthenticated,
    Authenticated(Arc<UserSession>),
}

/// Result of restoring persisted sessions during [`SessionRegistry::initialize`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: Vec<Did>,
    /// Accounts whose session could not be restored and were forgotten
    pub pruned: Vec<Did>,
}

#[derive(Debug)]
pub enum CallbackOutcome {
    /// The location had no callback parameters; treat it as a normal page load
    NotCallback,
    SignedIn {
        did: Did,
        /// The location saved before leaving for the authorization server
        redirect: Option<String>,
    },
    Failed(AuthError),
}

impl CallbackOutcome {
    pub fn success(&self) -> bool {
        matches!(self, CallbackOutcome::SignedIn { .. })
    }

    pub fn redirect(&self) -> Option<&str> {
        match self {
            CallbackOutcome::SignedIn { redirect, .. } => redirect.as_deref(),
            _ => None,
        }
    }
}

pub struct SessionRegistry {
    config: AuthConfig,
    provider: Arc<dyn OAuthProvider>,
    resolver: Arc<IdentityResolver>,
    store: SessionStore,
    navigator: Arc<dyn Navigator>,
    unauthenticated: Client,
    state: watch::Sender<RegistrySnapshot>,
    /// Serializes every operation that changes membership or the active account
    mutation: Mutex<()>,
}

impl SessionRegistry {
    /// A registry using the production resolver and an unauthenticated AppView client
    pub fn new(
        config: AuthConfig,
        provider: Arc<dyn OAuthProvider>,
        store: SessionStore,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| AuthError::Config(format!("failed to build HTTP client: {e}")))?;

        // Identity lookups go to arbitrary hosts, so the base URI is never used
        let resolver_http = ReqwestClientBuilder::new(&config.plc_directory_url)
            .client(http.clone())
            .build();
        let resolver = Arc::new(IdentityResolver::from_config(
            &config,
            Arc::new(resolver_http),
        ));
        let unauthenticated = Client::unauthenticated(http, &config.appview.url);

        Ok(Self::from_parts(
            config,
            provider,
            resolver,
            store,
            navigator,
            unauthenticated,
        ))
    }

    pub fn from_parts(
        config: AuthConfig,
        provider: Arc<dyn OAuthProvider>,
        resolver: Arc<IdentityResolver>,
        store: SessionStore,
        navigator: Arc<dyn Navigator>,
        unauthenticated: Client,
    ) -> Self {
        let (state, _) = watch::channel(RegistrySnapshot::empty());

        Self {
            config,
            provider,
            resolver,
            store,
            navigator,
            unauthenticated,
            state,
            mutation: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.state.borrow().clone()
    }

    /// Notified on every committed change; the replacement for reloading the page
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.state.subscribe()
    }

    pub fn status(&self) -> RegistryStatus {
        self.state.borrow().status
    }

    pub fn active_did(&self) -> Option<Did> {
        self.state.borrow().active.clone()
    }

    pub fn get(&self, did: &Did) -> Option<Arc<UserSession>> {
        self.state.borrow().get(did).cloned()
    }

    pub fn auth(&self) -> AuthState {
        match self.state.borrow().active_session() {
            Some(session) => AuthState::Authenticated(Arc::clone(session)),
            None => AuthState::Unauthenticated,
        }
    }

    /// The client every outbound call goes through: the active account's, or
    /// the unauthenticated one when nobody is active
    pub fn client(&self) -> Client {
        match self.auth() {
            AuthState::Authenticated(session) => session.client().clone(),
            AuthState::Unauthenticated => self.unauthenticated.clone(),
        }
    }

    pub fn is_valid_identifier(&self, identifier: &str) -> bool {
        classify_identifier(identifier) != IdentifierKind::Invalid
    }

    /// Where a finished sign-in should land when no location was saved
    pub fn default_redirect(&self) -> &str {
        &self.config.default_redirect
    }

    /// Configure the OAuth agent and restore every persisted account.
    ///
    /// Each account is restored independently; failures are forgotten (both
    /// here and in the agent's own storage) and never fail the whole batch.
    /// The restored set becomes visible in a single commit.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> RestoreReport {
        let _guard = self.mutation.lock().await;

        self.provider.configure(OAuthSetup {
            client: self.config.oauth.clone(),
            resolver: Arc::clone(&self.resolver),
        });
        self.state
            .send_modify(|state| state.status = RegistryStatus::Restoring);

        let stored = self.store.stored_dids().unwrap_or_else(|e| {
            error!(error = %e, "Failed to read stored accounts, starting signed out");
            vec![]
        });

        let attempts = join_all(stored.iter().map(|did| self.restore_one(did))).await;

        let mut restored = Vec::new();
        let mut pruned = Vec::new();
        for (did, attempt) in stored.into_iter().zip(attempts) {
            match attempt {
                Ok(session) => restored.push(session),
                Err(e) => {
                    error!(did = did.as_str(), error = ?e, "Failed to restore session");
                    self.forget_credential(&did).await;
                    pruned.push(did);
                }
            }
        }

        let restored_dids: Vec<Did> = restored.iter().map(|s| s.did().clone()).collect();
        if !pruned.is_empty() {
            if let Err(e) = self.store.set_stored_dids(&restored_dids) {
                error!(error = %e, "Failed to prune stored accounts");
            }
        }

        let persisted_active = self.store.active_user().unwrap_or_else(|e| {
            error!(error = %e, "Failed to read active account");
            None
        });
        let active = match &persisted_active {
            Some(did) if restored_dids.contains(did) => Some(did.clone()),
            _ => restored_dids.first().cloned(),
        };
        if active != persisted_active {
            if let Err(e) = self.store.set_active_user(active.as_ref()) {
                error!(error = %e, "Failed to persist active account");
            }
        }

        self.commit(|state| {
            state.sessions = restored;
            state.active = active;
            state.status = RegistryStatus::Ready;
        });

        info!(
            restored = restored_dids.len(),
            pruned = pruned.len(),
            active = ?self.active_did().map(|d| d.as_str().to_string()),
            "Session registry ready"
        );

        RestoreReport {
            restored: restored_dids,
            pruned,
        }
    }

    async fn restore_one(&self, did: &Did) -> Result<Arc<UserSession>, AuthError> {
        let session = self
            .agent_call(
                "session restore",
                self.provider.restore_session(did, true),
                |source| AuthError::RestoreFailed {
                    did: did.as_str().to_string(),
                    source,
                },
            )
            .await?;

        if &session.did != did {
            return Err(AuthError::RestoreFailed {
                did: did.as_str().to_string(),
                source: format!("agent returned a session for {}", session.did.as_str()).into(),
            });
        }

        Ok(self.user_session(session))
    }

    /// Start signing in with a handle, DID or PDS URL.
    ///
    /// Invalid identifiers fail before any I/O. On success the navigator has
    /// been sent to the returned authorization URL; the sign-in only completes
    /// through [`SessionRegistry::finalize_callback`].
    #[tracing::instrument(skip(self))]
    pub async fn initiate_sign_in(&self, identifier: &str) -> Result<Url, AuthError> {
        let Some(target) = AuthorizationTarget::from_identifier(identifier) else {
            error!("Invalid login identifier");
            return Err(AuthError::InvalidIdentifier(identifier.to_string()));
        };

        let url = self
            .agent_call(
                "authorization URL",
                self.provider
                    .authorization_url(&target, &self.config.oauth.scope),
                |source| match source.downcast::<ResolveError>() {
                    Ok(e) => AuthError::ResolutionFailed(*e),
                    Err(source) => AuthError::Authorization(source),
                },
            )
            .await?;

        self.store
            .save_redirect(&self.navigator.current_location())?;
        info!(kind = ?target.kind(), "Redirecting to authorization server");
        self.navigator.assign(&url);

        Ok(url)
    }

    /// Finish a sign-in from the callback's URL fragment.
    ///
    /// A fragment without `state` and `code`/`error` is not a callback and
    /// yields [`CallbackOutcome::NotCallback`] without contacting the agent.
    /// A failed exchange leaves the registry untouched.
    #[tracing::instrument(skip_all)]
    pub async fn finalize_callback(&self, fragment: &str) -> CallbackOutcome {
        let Some(params) = CallbackParams::from_fragment(fragment) else {
            return CallbackOutcome::NotCallback;
        };
        self.navigator.clear_fragment();

        let _guard = self.mutation.lock().await;

        let session = match self
            .agent_call(
                "authorization exchange",
                self.provider.finalize_authorization(&params),
                AuthError::CallbackExchangeFailed,
            )
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!(error = ?e, "Failed to create session");
                return CallbackOutcome::Failed(e);
            }
        };

        let did = session.did.clone();
        let user = self.user_session(session);
        self.commit(|state| {
            state.insert(user);
            state.active = Some(did.clone());
        });

        // The agent already holds the credential, so the account stays signed
        // in for this run even if it can't be written down
        let added = self.store.add_stored_did(&did);
        let activated = self.store.set_active_user(Some(&did));
        if let Err(e) = added.and(activated) {
            error!(did = did.as_str(), error = %e, "Failed to persist new session");
        }

        let redirect = self.store.take_redirect().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read saved redirect");
            None
        });
        info!(did = did.as_str(), "Authentication successful");

        CallbackOutcome::SignedIn { did, redirect }
    }

    /// Make `did` the active account. Unknown accounts are a logged no-op
    /// returning `Ok(false)`.
    #[tracing::instrument(skip(self), fields(did = did.as_str()))]
    pub async fn switch_user(&self, did: &Did) -> Result<bool, AuthError> {
        let _guard = self.mutation.lock().await;

        let (known, already_active) = {
            let state = self.state.borrow();
            (state.contains(did), state.active.as_ref() == Some(did))
        };
        if !known {
            warn!(did = did.as_str(), "Unknown account, ignoring");
            return Ok(false);
        }
        if already_active {
            return Ok(true);
        }

        self.store.set_active_user(Some(did))?;
        self.commit(|state| state.active = Some(did.clone()));
        info!("Switched active account");

        Ok(true)
    }

    /// Revoke and forget one account. Unknown accounts are a logged no-op
    /// returning `Ok(false)`.
    ///
    /// If the account was active, the first remaining account becomes active.
    /// The account is gone from the registry once its credential is revoked,
    /// even when updating the persisted state fails; that failure is returned
    /// afterwards.
    #[tracing::instrument(skip(self), fields(did = did.as_str()))]
    pub async fn sign_out(&self, did: &Did) -> Result<bool, AuthError> {
        let _guard = self.mutation.lock().await;

        let Some(user) = self.get(did) else {
            warn!(did = did.as_str(), "Unknown account, ignoring");
            return Ok(false);
        };

        self.revoke(&user).await;
        self.forget_credential(did).await;

        let (was_active, next_active) = {
            let state = self.state.borrow();
            let was_active = state.active.as_ref() == Some(did);
            let next = if was_active {
                state.first_other_than(did)
            } else {
                state.active.clone()
            };
            (was_active, next)
        };

        self.commit(|state| {
            state.remove(did);
            state.active = next_active.clone();
        });
        info!(was_active, "Signed out");

        let removed = self.store.remove_stored_did(did);
        let repointed = if was_active {
            self.store.set_active_user(next_active.as_ref())
        } else {
            Ok(())
        };
        if let Err(e) = removed.and(repointed) {
            error!(error = %e, "Failed to persist sign-out");
            return Err(e.into());
        }

        Ok(true)
    }

    /// Revoke and forget every account. The registry is emptied even when
    /// clearing the persisted state fails.
    #[tracing::instrument(skip(self))]
    pub async fn sign_out_all(&self) -> Result<(), AuthError> {
        let _guard = self.mutation.lock().await;

        let sessions = self.state.borrow().sessions.clone();
        join_all(sessions.iter().map(|user| async move {
            self.revoke(user).await;
            self.forget_credential(user.did()).await;
        }))
        .await;

        self.commit(|state| {
            state.sessions.clear();
            state.active = None;
        });
        info!(count = sessions.len(), "Signed out of every account");

        if let Err(e) = self.store.clear() {
            error!(error = %e, "Failed to clear persisted accounts");
            return Err(e.into());
        }

        Ok(())
    }

    /// Drop every in-memory session without revoking anything
    pub async fn dispose(&self) {
        let _guard = self.mutation.lock().await;
        self.commit(|state| {
            state.sessions.clear();
            state.active = None;
            state.status = RegistryStatus::Disposed;
        });
    }

    fn user_session(&self, session: OAuthSession) -> Arc<UserSession> {
        UserSession::new(
            session,
            Arc::clone(&self.provider),
            self.config.appview.proxy_target(),
        )
    }

    async fn revoke(&self, user: &UserSession) {
        let result = self
            .agent_call("revoke", user.sign_out(), |source| {
                AuthError::RevokeFailed {
                    did: user.did().as_str().to_string(),
                    source,
                }
            })
            .await;

        if let Err(e) = result {
            warn!(did = user.did().as_str(), error = ?e, "Failed to revoke session, forgetting it anyway");
        }
    }

    async fn forget_credential(&self, did: &Did) {
        let result = tokio::time::timeout(
            self.config.agent_timeout,
            self.provider.delete_stored_session(did),
        )
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(did = did.as_str(), error = %e, "Failed to delete stored session"),
            Err(_) => warn!(did = did.as_str(), "Timed out deleting stored session"),
        }
    }

    async fn agent_call<T, F, E>(
        &self,
        operation: &'static str,
        call: F,
        on_error: E,
    ) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, BoxError>>,
        E: FnOnce(BoxError) -> AuthError,
    {
        match tokio::time::timeout(self.config.agent_timeout, call).await {
            Ok(result) => result.map_err(on_error),
            Err(_) => Err(AuthError::Timeout {
                operation,
                after: self.config.agent_timeout,
            }),
        }
    }

    fn commit<F>(&self, change: F)
    where
        F: FnOnce(&mut RegistrySnapshot),
    {
        self.state.send_modify(|state| {
            change(state);
            let dangling = state.active.as_ref().is_some_and(|did| !state.contains(did));
            if dangling {
                error!("Active account missing from registry, clearing it");
                state.active = None;
            }
            state.version += 1;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_outcome_redirect() {
        let did = Did::new("did:plc:alice".to_string()).unwrap();

        let signed_in = CallbackOutcome::SignedIn {
            did,
            redirect: Some("/gifs/trending".to_string()),
        };
        assert!(signed_in.success());
        assert_eq!(signed_in.redirect(), Some("/gifs/trending"));

        let failed = CallbackOutcome::Failed(AuthError::InvalidIdentifier("bob".to_string()));
        assert!(!failed.success());
        assert_eq!(failed.redirect(), None);
        assert_eq!(CallbackOutcome::NotCallback.redirect(), None);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = RegistrySnapshot::empty();
        let did = Did::new("did:plc:alice".to_string()).unwrap();

        assert_eq!(snapshot.status, RegistryStatus::Uninitialized);
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.active_session().is_none());
        assert!(!snapshot.contains(&did));
        assert_eq!(snapshot.first_other_than(&did), None);
    }

    #[test]
    fn test_headless_navigator_reports_its_location() {
        let navigator = HeadlessNavigator::new("http://127.0.0.1:3000/");
        assert_eq!(navigator.current_location(), "http://127.0.0.1:3000/");
        navigator.assign(&Url::parse("https://auth.test/authorize").unwrap());
        navigator.clear_fragment();
    }
}
