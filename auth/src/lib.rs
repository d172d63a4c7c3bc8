//! Multi-account ATProto OAuth sessions for gifdex.
//!
//! [`SessionRegistry`] owns every signed-in account. Build one at startup,
//! call [`SessionRegistry::initialize`] to restore persisted accounts, and
//! route every outbound call through [`SessionRegistry::client`].

pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod identifier;
pub mod oauth;
pub mod resolver;
pub mod store;
pub mod user;

pub use auth::{
    AuthState, CallbackOutcome, HeadlessNavigator, Navigator, RegistrySnapshot, RegistryStatus,
    RestoreReport, SessionRegistry,
};
pub use client::{Client, ProxyTarget};
pub use config::AuthConfig;
pub use errors::{AuthError, ClientError, ResolveError, StoreError};
pub use identifier::{classify_identifier, AuthorizationTarget, IdentifierKind};
pub use oauth::{CallbackParams, OAuthProvider, OAuthSession};
pub use resolver::{IdentityResolver, ResolvedIdentity};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, SessionStore};
pub use user::{ProfileChanges, ProfileState, ProfileView, UserSession};
