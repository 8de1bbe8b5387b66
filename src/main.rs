use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use llm_completion::config::{Cli, Config};
use llm_completion::inference::loader::EngineLoader;
use llm_completion::inference::model_loader::{HubModelSource, ModelSource, ModelSpec};
use llm_completion::inference::stub::StubModelSource;
use llm_completion::metrics::Metrics;
use llm_completion::pipeline::CompletionPipeline;
use llm_completion::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "llm_completion=debug,tower_http=debug"
    } else {
        "llm_completion=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("llm-completion v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    let config = Arc::new(config);

    info!(
        model = config.model.model_id,
        revision = config.model.revision,
        device = ?config.model.device,
        stub = cli.stub_engine,
        "Configuration loaded"
    );

    // Pick where model artifacts come from.
    let source: Arc<dyn ModelSource> = if cli.stub_engine {
        Arc::new(StubModelSource::new())
    } else {
        Arc::new(HubModelSource::new(config.model.cache_dir.clone()))
    };

    let spec = ModelSpec::new(config.model.model_id.clone(), config.model.revision.clone());
    let loader = Arc::new(EngineLoader::new(source, spec, config.model.device));
    let pipeline = Arc::new(
        CompletionPipeline::new(loader.clone(), config.generation.timeout())
            .with_max_concurrent(config.server.max_concurrent_requests),
    );

    // Warm the engine in the background; requests wait on the same load.
    if config.model.preload {
        let loader = loader.clone();
        tokio::spawn(async move {
            if let Err(e) = loader.get_engine().await {
                error!("Background model load failed, will retry on first request: {e}");
            }
        });
    }

    let metrics = Metrics::new()?;
    let state = Arc::new(AppState::new(pipeline, config.clone(), metrics));

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
