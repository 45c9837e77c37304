//! Quake Fusion Feed — Binary Entrypoint
//! Boots tracing, config, the background ingestion orchestrator, and the
//! Axum HTTP surface serving the fused event feed.

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use quake_fusion::alerts::{AlertMux, LogAlertSink};
use quake_fusion::api;
use quake_fusion::cache::CacheStore;
use quake_fusion::config::PipelineConfig;
use quake_fusion::ingest::providers::afad_api::AfadApiProvider;
use quake_fusion::ingest::providers::afad_html::AfadHtmlProvider;
use quake_fusion::ingest::providers::aggregator::AggregatorProvider;
use quake_fusion::ingest::providers::kandilli_html::KandilliHtmlProvider;
use quake_fusion::ingest::types::SourceProvider;
use quake_fusion::metrics::Metrics;
use quake_fusion::orchestrator::Orchestrator;
use quake_fusion::resilience::ResilienceClient;
use quake_fusion::validate::advisor::build_advisor;
use quake_fusion::validate::Validator;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("quake_fusion=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = PipelineConfig::load_default()?;
    let metrics = Metrics::init(cfg.cycle_interval_secs);

    let resilience = Arc::new(ResilienceClient::new(cfg.resilience.clone()));
    let region = cfg.trust.region;
    let providers: Vec<Arc<dyn SourceProvider>> = vec![
        Arc::new(AfadApiProvider::new(resilience.clone())),
        Arc::new(AfadHtmlProvider::new(resilience.clone())),
        Arc::new(KandilliHtmlProvider::new(resilience.clone(), region)),
        Arc::new(AggregatorProvider::new(resilience.clone(), region)),
    ];

    let validator = Validator::new(cfg.trust.clone(), build_advisor());
    let cache = CacheStore::new(&cfg.cache.dir, cfg.cache.max_age_hours);
    let alerts = AlertMux::new(vec![Arc::new(LogAlertSink)]);

    let orchestrator = Orchestrator::new(
        cfg.clone(),
        providers,
        validator,
        cache,
        Vec::new(),
        alerts,
    );
    orchestrator.start();

    let app = api::create_router(orchestrator.clone()).merge(metrics.router());
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!(addr = %cfg.bind_addr, "serving fused event feed");
    axum::serve(listener, app).await?;

    Ok(())
}
