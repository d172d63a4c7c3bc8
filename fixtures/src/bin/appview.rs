use clap::Parser;
use fixtures::{appview, load_identities, run_server, FixtureArgs};

/// AppView fixture server
#[derive(Parser, Debug)]
#[clap(name = "appview-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let identities = load_identities(&args.common)?;
    run_server(args.common, appview::router(identities)).await
}
