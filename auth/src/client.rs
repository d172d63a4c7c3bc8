//! XRPC API client.
//!
//! The `net.gifdex.*` lexicons have no typed bindings in `atrium-api`, so
//! [`Client`] sends them through `atrium-xrpc` directly. It runs either over a
//! signed-in account's [`UserAgent`], which carries the AppView proxy header,
//! or over a plain [`ReqwestClient`] for signed-out visitors.

use std::sync::Arc;

use atrium_api::types::string::Did;
use atrium_xrpc::error::ErrorResponseBody;
use atrium_xrpc::http::Method;
use atrium_xrpc::{InputDataOrBytes, OutputDataOrBytes, XrpcClient, XrpcRequest};
use atrium_xrpc_client::reqwest::{ReqwestClient, ReqwestClientBuilder};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::errors::ClientError;
use crate::oauth::UserAgent;

/// Header telling the PDS which service to forward a call to
pub const PROXY_HEADER: &str = "atproto-proxy";

/// The downstream service an authenticated call is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub did: Did,
    /// Service id within the DID document, including the leading `#`
    pub service_id: String,
}

impl ProxyTarget {
    /// The service id without its `#`, the form atrium's proxy configuration takes
    pub fn service_type(&self) -> &str {
        self.service_id.trim_start_matches('#')
    }
}

#[derive(Clone)]
enum Transport {
    Account(Arc<UserAgent>),
    Public(Arc<ReqwestClient>),
}

#[derive(Clone)]
pub struct Client {
    transport: Transport,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("did", &self.did().map(Did::as_str))
            .field("base_uri", &self.base_uri())
            .finish()
    }
}

impl Client {
    /// Calls on behalf of `agent`'s account, through whatever proxy it has configured
    pub fn authenticated(agent: Arc<UserAgent>) -> Self {
        Self {
            transport: Transport::Account(agent),
        }
    }

    /// A client with no credential, talking straight to `service_url`
    pub fn unauthenticated(http: reqwest::Client, service_url: &str) -> Self {
        let xrpc = ReqwestClientBuilder::new(service_url).client(http).build();
        Self {
            transport: Transport::Public(Arc::new(xrpc)),
        }
    }

    /// The account calls are made for, `None` when signed out
    pub fn did(&self) -> Option<&Did> {
        match &self.transport {
            Transport::Account(agent) => Some(agent.did()),
            Transport::Public(_) => None,
        }
    }

    pub fn base_uri(&self) -> String {
        match &self.transport {
            Transport::Account(agent) => agent.base_uri(),
            Transport::Public(client) => client.base_uri(),
        }
    }

    pub async fn query<P, O>(&self, nsid: &str, params: P) -> Result<O, ClientError>
    where
        P: Serialize + Send + Sync,
        O: DeserializeOwned + Send + Sync,
    {
        self.send(&XrpcRequest::<P, ()> {
            method: Method::GET,
            nsid: nsid.to_string(),
            parameters: Some(params),
            input: None,
            encoding: None,
        })
        .await
    }

    pub async fn procedure<I, O>(&self, nsid: &str, input: I) -> Result<O, ClientError>
    where
        I: Serialize + Send + Sync,
        O: DeserializeOwned + Send + Sync,
    {
        self.send(&XrpcRequest::<(), I> {
            method: Method::POST,
            nsid: nsid.to_string(),
            parameters: None,
            input: Some(InputDataOrBytes::Data(input)),
            encoding: Some("application/json".to_string()),
        })
        .await
    }

    async fn send<P, I, O>(&self, request: &XrpcRequest<P, I>) -> Result<O, ClientError>
    where
        P: Serialize + Send + Sync,
        I: Serialize + Send + Sync,
        O: DeserializeOwned + Send + Sync,
    {
        let output = match &self.transport {
            Transport::Account(agent) => {
                agent
                    .send_xrpc::<P, I, O, ErrorResponseBody>(request)
                    .await
            }
            Transport::Public(client) => {
                client
                    .send_xrpc::<P, I, O, ErrorResponseBody>(request)
                    .await
            }
        };

        match output {
            Ok(OutputDataOrBytes::Data(data)) => Ok(data),
            // Procedures without output answer with an empty body
            Ok(OutputDataOrBytes::Bytes(bytes)) if bytes.is_empty() => {
                Ok(serde_json::from_value(Value::Null)?)
            }
            Ok(OutputDataOrBytes::Bytes(_)) => {
                Err(ClientError::UnexpectedResponse(request.nsid.clone()))
            }
            Err(e) => Err(ClientError::from_xrpc(&request.nsid, e)),
        }
    }
}
