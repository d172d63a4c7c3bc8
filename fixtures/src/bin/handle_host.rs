use clap::Parser;
use fixtures::{
    handle_host::{self, HandleHostConfig},
    load_identities, run_server, FixtureArgs,
};

/// Handle host fixture server (DoH JSON + well-known atproto-did)
#[derive(Parser, Debug)]
#[clap(name = "handle-host-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,

    /// Only publish handles over DoH, not at the well-known path
    #[arg(long)]
    dns_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let identities = load_identities(&args.common)?;
    let config = HandleHostConfig {
        dns: identities.clone(),
        well_known: if args.dns_only { vec![] } else { identities },
        ..Default::default()
    };

    run_server(args.common, handle_host::router(config)).await
}
