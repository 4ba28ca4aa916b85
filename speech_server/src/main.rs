use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use speech_core::builtin::CharTokenizer;
use speech_core::{JsonFileStore, SpeakerRegistry, Stages, Synthesizer};
use tokio::net::TcpListener;
use tracing::{info, warn};

use speech_server::config::ServerConfig;
use speech_server::{build_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting speech synthesis server...");

    let config = ServerConfig::from_env();
    let pipeline = config.pipeline_config()?;
    info!(
        "Pipeline: {} Hz, {} workers, {} ms stage timeout",
        pipeline.sample_rate, pipeline.max_concurrent_requests, pipeline.stage_timeout_ms
    );

    let registry = match &config.registry_path {
        Some(path) => {
            let registry = SpeakerRegistry::with_store(Arc::new(JsonFileStore::new(path)));
            let loaded = registry
                .load()
                .with_context(|| format!("Failed to load speakers from {}", path.display()))?;
            info!("Loaded {} speakers from {}", loaded, path.display());
            registry
        }
        None => {
            warn!("SPEAKER_REGISTRY_PATH not set, enrolled speakers are kept in memory only");
            SpeakerRegistry::new()
        }
    };

    let mut stages = Stages::builtin(&pipeline);
    if let Some(path) = &config.vocab_path {
        stages.tokenizer = Arc::new(CharTokenizer::from_vocab_file(path)?);
        info!("Tokenizer vocabulary loaded from {}", path.display());
    }

    let synth = Synthesizer::new(pipeline, stages, Arc::new(registry));
    let state = AppState::new(synth, config.clone());
    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, request_timeout={}s",
        config.port, config.rate_limit_per_minute, config.request_timeout_secs
    );

    let app = build_app(state, &config)?;

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT."))?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
