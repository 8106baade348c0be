use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use nestegg::api::{Cli, run};

#[tokio::main]
async fn main() {
    // Reports go to stdout; keep logs on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "nestegg=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}
