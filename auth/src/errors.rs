use std::fmt::Debug;
use std::time::Duration;

use atrium_xrpc::error::{ErrorResponseBody, XrpcError};
use serde::Serialize;
use thiserror::Error;

/// Failure reported by an external collaborator (OAuth agent, transport).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One resolution method's reason for failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodFailure {
    pub method: &'static str,
    pub reason: String,
}

impl std::fmt::Display for MethodFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.method, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("not a handle or DID: {0}")]
    InvalidActor(String),

    #[error("could not resolve handle {handle}: {}", join_failures(.failures))]
    HandleResolutionFailed {
        handle: String,
        failures: Vec<MethodFailure>,
    },

    #[error("unsupported DID method: {0}")]
    UnsupportedDidMethod(String),

    #[error("failed to resolve DID document for {did}: {reason}")]
    DidDocument { did: String, reason: String },

    #[error("DID document for {0} has no #atproto_pds service")]
    MissingPdsEndpoint(String),
}

fn join_failures(failures: &[MethodFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to persist storage file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

fn format_message(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(" ({m})"))
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[source] BoxError),

    #[error("{nsid} rejected the credential: {challenge}")]
    Authentication { nsid: String, challenge: String },

    #[error("{nsid} returned HTTP {status}: {error}{}", format_message(.message))]
    Xrpc {
        nsid: String,
        status: u16,
        error: String,
        message: Option<String>,
    },

    #[error("failed to encode request: {0}")]
    Encode(#[source] BoxError),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0} answered with something other than JSON")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Flatten an `atrium-xrpc` error from a call to `nsid`.
    ///
    /// Lexicon-specific error enums serialize to the same `{error, message}`
    /// shape as undeclared ones, so both end up in [`ClientError::Xrpc`].
    pub fn from_xrpc<E>(nsid: &str, err: atrium_xrpc::Error<E>) -> Self
    where
        E: Serialize + Debug,
    {
        match err {
            atrium_xrpc::Error::XrpcResponse(XrpcError { status, error }) => {
                let body = error
                    .and_then(|kind| serde_json::to_value(kind).ok())
                    .and_then(|value| serde_json::from_value::<ErrorResponseBody>(value).ok());
                let (error, message) = body
                    .map(|body| (body.error, body.message))
                    .unwrap_or_default();

                ClientError::Xrpc {
                    nsid: nsid.to_string(),
                    status: status.as_u16(),
                    error: error.unwrap_or_else(|| "Unknown".to_string()),
                    message,
                }
            }
            atrium_xrpc::Error::Authentication(challenge) => ClientError::Authentication {
                nsid: nsid.to_string(),
                challenge: String::from_utf8_lossy(challenge.as_bytes()).into_owned(),
            },
            atrium_xrpc::Error::HttpClient(e) => ClientError::Transport(e),
            atrium_xrpc::Error::HttpRequest(e) => ClientError::Encode(Box::new(e)),
            atrium_xrpc::Error::SerdeHtmlForm(e) => ClientError::Encode(Box::new(e)),
            atrium_xrpc::Error::SerdeJson(e) => ClientError::Decode(e),
            atrium_xrpc::Error::UnexpectedResponseType => {
                ClientError::UnexpectedResponse(nsid.to_string())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid sign-in identifier: {0:?}")]
    InvalidIdentifier(String),

    /// The account named at sign-in could not be resolved to a PDS
    #[error(transparent)]
    ResolutionFailed(#[from] ResolveError),

    #[error("failed to restore session for {did}")]
    RestoreFailed {
        did: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to revoke session for {did}")]
    RevokeFailed {
        did: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to create authorization URL")]
    Authorization(#[source] BoxError),

    #[error("authorization callback exchange failed")]
    CallbackExchangeFailed(#[source] BoxError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
