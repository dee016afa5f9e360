use clap::Parser;
use jobforge_core::HandlerRegistry;
use jobforge_worker::{cli::Cli, config, logging, EXIT_CONFIG_ERROR, EXIT_CRASH, EXIT_OK};

#[tokio::main]
async fn main() {
    logging::init();

    let cli = Cli::parse();
    let app = match config::load_from_env() {
        Ok(app) => app,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    // No handlers registered: this binary is the bare deployment
    // skeleton. Real deployments register their own job types and call
    // `jobforge_worker::run` from their own `main`, as `demos/` does.
    let registry = HandlerRegistry::builder().build();

    match jobforge_worker::run(cli, app, registry).await {
        Ok(()) => std::process::exit(EXIT_OK),
        Err(err) => {
            tracing::error!(error = %err, "worker exited unexpectedly");
            std::process::exit(EXIT_CRASH);
        }
    }
}
