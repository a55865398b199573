//! igord - the igor-ci server entry point.

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

/// igor-ci coordination server.
#[derive(Debug, Parser)]
struct Args {
    /// TCP port to listen on.
    #[arg(long, default_value_t = igord::DEFAULT_PORT)]
    port: u16,

    /// Log level (falls back to INFO on an unrecognised value).
    #[arg(long, env = "IGORD_LOGGING")]
    logging: Option<String>,
}

fn main() {
    let args = Args::parse();

    let filter = args
        .logging
        .as_deref()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        tokio::select! {
            result = igord::serve(args.port) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "server error");
                    std::process::exit(1);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
        }
    });
}
