//! Sign-in identifier classification.
//!
//! A user can start a sign-in with a handle (`alice.bsky.social`, optionally
//! written `@alice.bsky.social`), a DID, or the URL of their PDS.

use atrium_api::types::string::{Did, Handle};
use reqwest::Url;
use serde::Serialize;

/// A parsed account identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Did(Did),
    Handle(Handle),
}

impl Actor {
    /// Parse a DID or handle. Returns `None` for anything else.
    pub fn parse(input: &str) -> Option<Self> {
        if input.starts_with("did:") {
            return Did::new(input.to_string()).ok().map(Actor::Did);
        }
        Handle::new(input.to_string()).ok().map(Actor::Handle)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Actor::Did(did) => did.as_str(),
            Actor::Handle(handle) => handle.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    /// A handle or DID
    Account,
    /// An http(s) URL of a PDS or entryway
    ServiceEndpoint,
    Invalid,
}

/// The `target` of an outbound authorization request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum AuthorizationTarget {
    #[serde(rename = "account")]
    Account { identifier: String },
    #[serde(rename = "pds", rename_all = "camelCase")]
    Pds { service_url: String },
}

impl AuthorizationTarget {
    /// Classify `identifier` and build the matching target. Never performs I/O.
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        let clean = strip_at(identifier);

        if Actor::parse(clean).is_some() {
            return Some(AuthorizationTarget::Account {
                identifier: clean.to_string(),
            });
        }

        let url = Url::parse(clean).ok()?;
        matches!(url.scheme(), "http" | "https").then(|| AuthorizationTarget::Pds {
            service_url: clean.to_string(),
        })
    }

    pub fn kind(&self) -> IdentifierKind {
        match self {
            AuthorizationTarget::Account { .. } => IdentifierKind::Account,
            AuthorizationTarget::Pds { .. } => IdentifierKind::ServiceEndpoint,
        }
    }
}

pub fn classify_identifier(identifier: &str) -> IdentifierKind {
    AuthorizationTarget::from_identifier(identifier)
        .map(|target| target.kind())
        .unwrap_or(IdentifierKind::Invalid)
}

// OAuth doesn't accept the leading @
fn strip_at(identifier: &str) -> &str {
    identifier.strip_prefix('@').unwrap_or(identifier)
}
