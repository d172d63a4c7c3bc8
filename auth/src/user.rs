use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atrium_api::agent::{Agent, CloneWithProxy as _};
use atrium_api::com::atproto::repo::{get_record, put_record};
use atrium_api::types::string::{Did, Nsid, RecordKey};
use atrium_api::types::TryIntoUnknown as _;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::client::{Client, ProxyTarget};
use crate::errors::{BoxError, ClientError};
use crate::oauth::{OAuthProvider, OAuthSession, UserAgent};

pub const GET_PROFILE_NSID: &str = "net.gifdex.actor.getProfile";
pub const PROFILE_COLLECTION: &str = "net.gifdex.actor.profile";
const PROFILE_RKEY: &str = "self";

/// A profile as the AppView presents it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub did: String,
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub pronouns: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub indexed_at: Option<String>,
}

/// The `net.gifdex.actor.profile/self` record stored in the user's repo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    #[serde(rename = "$type")]
    pub record_type: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pronouns: Option<String>,
    /// Blob reference, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<Value>,
}

/// Fields to change on the profile record; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub display_name: Option<String>,
    pub pronouns: Option<String>,
    pub avatar: Option<Value>,
}

impl ProfileChanges {
    fn apply(self, current: Option<ProfileRecord>) -> ProfileRecord {
        let current = current.unwrap_or_else(|| ProfileRecord {
            record_type: PROFILE_COLLECTION.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            display_name: None,
            pronouns: None,
            avatar: None,
        });

        ProfileRecord {
            record_type: PROFILE_COLLECTION.to_string(),
            created_at: current.created_at,
            display_name: self.display_name.or(current.display_name),
            pronouns: self.pronouns.or(current.pronouns),
            avatar: self.avatar.or(current.avatar),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileState {
    pub profile: Option<ProfileView>,
    pub is_loading: bool,
    pub error: Option<String>,
}

/// What a call to [`UserSession::fetch_profile`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileFetch {
    Updated,
    Failed,
    /// Another fetch was already running; nothing happened
    AlreadyInFlight,
}

/// One signed-in account
pub struct UserSession {
    did: Did,
    /// Talks to the PDS itself, for repo operations
    agent: Agent<UserAgent>,
    /// Same credential, with the AppView proxy header configured
    appview: Arc<UserAgent>,
    client: Client,
    profile: watch::Sender<ProfileState>,
    fetching: AtomicBool,
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("did", &self.did.as_str())
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl UserSession {
    /// Wrap `session` and kick off the first profile load in the background
    pub fn new(
        session: OAuthSession,
        provider: Arc<dyn OAuthProvider>,
        proxy: ProxyTarget,
    ) -> Arc<Self> {
        let did = session.did.clone();
        let pds = UserAgent::new(provider, session);
        let appview = Arc::new(pds.clone_with_proxy(proxy.did.clone(), proxy.service_type()));
        let client = Client::authenticated(Arc::clone(&appview));
        let (profile, _) = watch::channel(ProfileState::default());

        let user = Arc::new(Self {
            did,
            agent: Agent::new(pds),
            appview,
            client,
            profile,
            fetching: AtomicBool::new(false),
        });
        user.spawn_initial_fetch();
        user
    }

    fn spawn_initial_fetch(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(did = self.did.as_str(), "No runtime, profile loads on first refresh");
            return;
        };

        if self.try_claim_fetch() {
            let user = Arc::clone(self);
            runtime.spawn(async move {
                user.run_claimed_fetch().await;
            });
        }
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    /// Agent for calls served by the account's own PDS
    pub fn agent(&self) -> &Agent<UserAgent> {
        &self.agent
    }

    pub fn session(&self) -> &OAuthSession {
        self.appview.session()
    }

    /// Revoke the credential with the authorization server
    pub async fn sign_out(&self) -> Result<(), BoxError> {
        self.appview.sign_out().await
    }

    /// Client addressed to the AppView through the user's PDS
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn profile(&self) -> Option<ProfileView> {
        self.profile.borrow().profile.clone()
    }

    pub fn profile_error(&self) -> Option<String> {
        self.profile.borrow().error.clone()
    }

    pub fn is_loading_profile(&self) -> bool {
        self.profile.borrow().is_loading
    }

    pub fn profile_state(&self) -> ProfileState {
        self.profile.borrow().clone()
    }

    pub fn subscribe_profile(&self) -> watch::Receiver<ProfileState> {
        self.profile.subscribe()
    }

    /// Reload the profile from the AppView.
    ///
    /// At most one fetch runs at a time; calling this while one is in flight
    /// returns [`ProfileFetch::AlreadyInFlight`] without touching any state.
    pub async fn fetch_profile(&self) -> ProfileFetch {
        if !self.try_claim_fetch() {
            debug!(did = self.did.as_str(), "Profile fetch already in flight");
            return ProfileFetch::AlreadyInFlight;
        }
        self.run_claimed_fetch().await
    }

    /// Set the in-flight flag if it is clear. Never suspends.
    fn try_claim_fetch(&self) -> bool {
        if self
            .fetching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.profile.send_modify(|state| state.is_loading = true);
        true
    }

    async fn run_claimed_fetch(&self) -> ProfileFetch {
        let _guard = FetchGuard { user: self };

        let result: Result<ProfileView, ClientError> = self
            .client
            .query(GET_PROFILE_NSID, &[("actor", self.did.as_str())])
            .await;

        match result {
            Ok(profile) => {
                self.profile.send_modify(|state| {
                    state.profile = Some(profile);
                    state.error = None;
                });
                ProfileFetch::Updated
            }
            Err(e) => {
                error!(did = self.did.as_str(), error = %e, "Failed to fetch profile");
                // Keep whatever profile we already had
                self.profile
                    .send_modify(|state| state.error = Some(e.to_string()));
                ProfileFetch::Failed
            }
        }
    }

    /// Merge `changes` into the profile record on the PDS, then reload the profile
    #[tracing::instrument(skip(self, changes), fields(did = self.did.as_str()), err)]
    pub async fn update_profile(&self, changes: ProfileChanges) -> Result<(), ClientError> {
        let collection = Nsid::new(PROFILE_COLLECTION.to_string())
            .map_err(|e| ClientError::Encode(e.into()))?;
        let rkey =
            RecordKey::new(PROFILE_RKEY.to_string()).map_err(|e| ClientError::Encode(e.into()))?;

        // Repo operations are served by the PDS itself, not the AppView
        let repo = &self.agent.api.com.atproto.repo;

        let current = match repo
            .get_record(
                get_record::ParametersData {
                    cid: None,
                    collection: collection.clone(),
                    repo: self.did.clone().into(),
                    rkey: rkey.clone(),
                }
                .into(),
            )
            .await
        {
            Ok(output) => {
                let value = serde_json::to_value(&output.data.value)?;
                Some(serde_json::from_value::<ProfileRecord>(value)?)
            }
            Err(e) => match ClientError::from_xrpc(get_record::NSID, e) {
                ClientError::Xrpc { error, .. } => {
                    debug!(%error, "No existing profile record, creating one");
                    None
                }
                e => return Err(e),
            },
        };

        let record = changes
            .apply(current)
            .try_into_unknown()
            .map_err(|e| ClientError::Encode(Box::new(e)))?;
        repo.put_record(
            put_record::InputData {
                collection,
                record,
                repo: self.did.clone().into(),
                rkey,
                swap_commit: None,
                swap_record: None,
                validate: None,
            }
            .into(),
        )
        .await
        .map_err(|e| ClientError::from_xrpc(put_record::NSID, e))?;
        info!("Profile record updated");

        // Pick up processed fields (avatar URL etc.) from the AppView
        self.fetch_profile().await;
        Ok(())
    }
}

/// Clears the in-flight flag however the fetch ends, including cancellation
struct FetchGuard<'a> {
    user: &'a UserSession,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        // Cleared under the channel lock so a new claim can't be overwritten
        self.user.profile.send_modify(|state| {
            state.is_loading = false;
            self.user.fetching.store(false, Ordering::Release);
        });
    }
}
