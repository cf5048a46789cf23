//! Optimizer server entry point.
//!
//! Loads configuration, wires up the datafile repository, counter store,
//! and recalculation scheduler, and serves the REST surface until a
//! shutdown signal arrives.

use variant_weight_optimizer::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,variant_weight_optimizer=debug".into()),
        )
        .init();

    let config = Config::load()?;
    variant_weight_optimizer::run_server(config).await
}
