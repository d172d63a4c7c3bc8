use axum::Router;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub mod appview;
pub mod handle_host;
pub mod plc_directory;

/// Common CLI arguments for all fixture servers
#[derive(Parser, Debug, Clone)]
pub struct FixtureArgs {
    /// The port to listen on
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// The host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// JSON file containing an array of fixture identities to serve
    #[arg(short, long)]
    pub data: Option<PathBuf>,
}

/// A fake account known to the fixture services.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureIdentity {
    pub did: String,
    pub handle: String,
    pub pds_url: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl FixtureIdentity {
    pub fn new(did: &str, handle: &str, pds_url: &str) -> Self {
        Self {
            did: did.to_string(),
            handle: handle.to_string(),
            pds_url: pds_url.to_string(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = Some(display_name.to_string());
        self
    }

    /// The DID document the PLC directory (or a did:web host) serves for this identity
    pub fn did_document(&self) -> Value {
        json!({
            "@context": ["https://w3id.org/did/v1"],
            "id": self.did,
            "alsoKnownAs": [format!("at://{}", self.handle)],
            "verificationMethod": [
                {
                    "id": format!("{}#atproto", self.did),
                    "type": "Multikey",
                    "controller": self.did,
                    "publicKeyMultibase": "zQ3shXjHeiBuRCKmM36cuYnm7YEMzhGnCmCyW92sRJ9pribSF"
                }
            ],
            "service": [
                {
                    "id": "#atproto_pds",
                    "type": "AtprotoPersonalDataServer",
                    "serviceEndpoint": self.pds_url
                }
            ]
        })
    }
}

/// Load fixture identities from the `--data` file, if one was given
pub fn load_identities(args: &FixtureArgs) -> anyhow::Result<Vec<FixtureIdentity>> {
    let Some(data_path) = &args.data else {
        return Ok(vec![]);
    };

    let data = std::fs::read_to_string(data_path)?;
    let identities: Vec<FixtureIdentity> = serde_json::from_str(&data)?;
    info!(
        "Loaded {} fixture identities from {}",
        identities.len(),
        data_path.display()
    );

    Ok(identities)
}

/// Common function to run a fixture server
pub async fn run_server(args: FixtureArgs, app: Router) -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let addr = format!("{}:{}", args.host, args.port).parse::<SocketAddr>()?;

    let app = app.layer(TraceLayer::new_for_http());

    info!("Fixture server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// A fixture server running inside the current tokio runtime.
///
/// The server task is aborted when this value is dropped.
pub struct RunningFixture {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl RunningFixture {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for RunningFixture {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve `app` on an ephemeral loopback port, for use from tests
pub async fn spawn_server(app: Router) -> anyhow::Result<RunningFixture> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Fixture server on {} stopped: {}", addr, e);
        }
    });

    Ok(RunningFixture { addr, handle })
}
