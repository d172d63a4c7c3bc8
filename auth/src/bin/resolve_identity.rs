use std::sync::Arc;

use atrium_xrpc_client::reqwest::ReqwestClientBuilder;
use clap::Parser;
use color_eyre::eyre::Result;
use gifdex_auth::{AuthConfig, IdentityResolver};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

/// Resolve a handle or DID the same way sign-in does
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Handle (alice.bsky.social) or DID (did:plc:...)
    actor: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_indent_lines(true),
        )
        .init();

    let args = Args::parse();
    let config = AuthConfig::from_env()?;

    let reqwest_client = reqwest::Client::builder().use_rustls_tls().build()?;
    let http_client = ReqwestClientBuilder::new(&config.plc_directory_url)
        .client(reqwest_client)
        .build();
    let resolver = IdentityResolver::from_config(&config, Arc::new(http_client));

    let identity = resolver.resolve(&args.actor).await?;

    println!("DID:    {}", identity.did.as_str());
    match &identity.handle {
        Some(handle) => println!("Handle: {}", handle.as_str()),
        None => println!("Handle: (not verified)"),
    }
    println!("PDS:    {}", identity.pds);

    Ok(())
}
