use std::time::Duration;

use atrium_api::types::string::Did;
use reqwest::Url;

use crate::client::ProxyTarget;
use crate::errors::AuthError;

pub const DEFAULT_APPVIEW_DID: &str = "did:web:api.gifdex.net";
pub const DEFAULT_APPVIEW_URL: &str = "https://api.gifdex.net";
pub const DEFAULT_APPVIEW_SERVICE_ID: &str = "#gifdex_appview";
pub const DEFAULT_PLC_DIRECTORY_URL: &str = "https://plc.directory";
pub const DEFAULT_DOH_URL: &str = "https://cloudflare-dns.com/dns-query";
pub const DEFAULT_SCOPE: &str = "atproto transition:generic";

/// Settings handed to the OAuth agent when it is configured
#[derive(Debug, Clone)]
pub struct OAuthClientSettings {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    /// Namespace the agent keeps its own credential storage under
    pub storage_name: String,
}

/// The AppView every authenticated call is proxied to
#[derive(Debug, Clone)]
pub struct AppViewSettings {
    pub did: Did,
    pub url: String,
    pub service_id: String,
}

impl AppViewSettings {
    pub fn proxy_target(&self) -> ProxyTarget {
        ProxyTarget {
            did: self.did.clone(),
            service_id: self.service_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub oauth: OAuthClientSettings,
    pub appview: AppViewSettings,
    pub plc_directory_url: String,
    pub doh_url: String,
    /// Upper bound on each identity resolution method
    pub resolver_timeout: Duration,
    /// Upper bound on each call into the OAuth agent (restore, exchange, revoke)
    pub agent_timeout: Duration,
    /// Where a finished sign-in lands when no pre-redirect location was saved
    pub default_redirect: String,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, AuthError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup, falling back to production defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AuthError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let appview_did = var("APPVIEW_DID", DEFAULT_APPVIEW_DID);
        let appview_did = Did::new(appview_did.clone())
            .map_err(|e| AuthError::Config(format!("APPVIEW_DID {appview_did:?}: {e}")))?;

        let config = Self {
            oauth: OAuthClientSettings {
                client_id: var("OAUTH_CLIENT_ID", "http://localhost"),
                redirect_uri: var("OAUTH_REDIRECT_URI", "http://127.0.0.1/oauth/callback"),
                scope: var("OAUTH_SCOPE", DEFAULT_SCOPE),
                storage_name: var("OAUTH_STORAGE_NAME", "gifdex-oauth"),
            },
            appview: AppViewSettings {
                did: appview_did,
                url: http_url("APPVIEW_URL", var("APPVIEW_URL", DEFAULT_APPVIEW_URL))?,
                service_id: var("APPVIEW_SERVICE_ID", DEFAULT_APPVIEW_SERVICE_ID),
            },
            plc_directory_url: http_url(
                "PLC_DIRECTORY_URL",
                var("PLC_DIRECTORY_URL", DEFAULT_PLC_DIRECTORY_URL),
            )?,
            doh_url: http_url("DOH_URL", var("DOH_URL", DEFAULT_DOH_URL))?,
            resolver_timeout: millis("RESOLVER_TIMEOUT_MS", lookup("RESOLVER_TIMEOUT_MS"), 10_000)?,
            agent_timeout: millis("AGENT_TIMEOUT_MS", lookup("AGENT_TIMEOUT_MS"), 30_000)?,
            default_redirect: var("DEFAULT_REDIRECT", "/"),
        };

        if !config.appview.service_id.starts_with('#') {
            return Err(AuthError::Config(format!(
                "APPVIEW_SERVICE_ID must start with '#', got {:?}",
                config.appview.service_id
            )));
        }

        Ok(config)
    }
}

fn http_url(key: &str, value: String) -> Result<String, AuthError> {
    let url = Url::parse(&value).map_err(|e| AuthError::Config(format!("{key} {value:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AuthError::Config(format!(
            "{key} must be an http(s) URL, got {value:?}"
        )));
    }

    // Make sure the URL doesn't have a trailing slash for consistency
    Ok(value.trim_end_matches('/').to_string())
}

fn millis(key: &str, value: Option<String>, default: u64) -> Result<Duration, AuthError> {
    match value {
        None => Ok(Duration::from_millis(default)),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| AuthError::Config(format!("{key} {raw:?}: {e}"))),
    }
}
