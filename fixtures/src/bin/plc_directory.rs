use clap::Parser;
use fixtures::{load_identities, plc_directory, run_server, FixtureArgs};

/// PLC Directory fixture server
#[derive(Parser, Debug)]
#[clap(name = "plc-directory-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let identities = load_identities(&args.common)?;
    let app = plc_directory::router(identities).fallback(
        |req: axum::http::Request<axum::body::Body>| async move {
            eprintln!("WARNING: Unhandled request: {} {}", req.method(), req.uri());
            (
                axum::http::StatusCode::NOT_FOUND,
                format!("No route found for {} {}", req.method(), req.uri()),
            )
        },
    );

    run_server(args.common, app).await
}
