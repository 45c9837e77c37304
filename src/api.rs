// src/api.rs
use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tower_http::cors::CorsLayer;

use crate::ingest::types::FusedEvent;
use crate::orchestrator::{CyclePhase, Orchestrator, ProviderHealth};

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
}

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/events", get(events))
        .route("/status", get(status))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// The last published, validated event set.
async fn events(State(state): State<AppState>) -> Json<Vec<FusedEvent>> {
    Json(state.orchestrator.get_last_published())
}

#[derive(serde::Serialize)]
struct StatusResp {
    running: bool,
    suspended: bool,
    /// True only when serving cache older than the degraded threshold;
    /// briefer staleness is normal operation.
    degraded: bool,
    phase: CyclePhase,
    published_events: usize,
    cache_age_minutes: Option<i64>,
    last_cycle_at_ms: Option<i64>,
    providers: HashMap<&'static str, ProviderHealth>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResp> {
    let o = &state.orchestrator;
    Json(StatusResp {
        running: o.is_running(),
        suspended: o.is_suspended(),
        degraded: o.is_degraded(),
        phase: o.phase(),
        published_events: o.get_last_published().len(),
        cache_age_minutes: o.cache_age_minutes(),
        last_cycle_at_ms: o.last_cycle_at_ms(),
        providers: o.provider_health(),
    })
}
