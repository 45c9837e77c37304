// src/orchestrator.rs
//! Ingestion orchestrator: a single periodic background task drives one
//! fetch cycle through fetch → normalize → dedupe → fuse → validate →
//! publish. Providers fan out concurrently and all settle before the pure
//! stages run. Overlapping cycle requests are dropped, not queued; a slow
//! cycle simply delays the next tick.
//!
//! The consumer always has the best available data: cached events are
//! published before the first network round-trip, zero-survivor cycles
//! retain the previous publish, and total cycle failure falls back to the
//! cache, surfacing a degraded state only past the staleness threshold.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::alerts::{estimate_intensity, AlertMux, EventAlert};
use crate::cache::CacheStore;
use crate::config::PipelineConfig;
use crate::dedup::dedupe;
use crate::fusion::fuse;
use crate::ingest::types::{Event, FusedEvent, SourceProvider};
use crate::ingest::{self, group_by_source};
use crate::normalize::normalize_batch;
use crate::validate::{ValidationContext, Validator};

/// Alerts are only forwarded for events this fresh.
const ALERT_MAX_AGE_MS: i64 = 10 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Fetching,
    Normalizing,
    Fusing,
    Validating,
    Publishing,
    Suspended,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProviderHealth {
    pub last_success_ms: Option<i64>,
    pub error_count: u64,
}

/// Downstream consumer boundary (alerting/UI). Called on every publish.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn on_publish(&self, events: &[FusedEvent]);
}

enum PublishKind {
    /// Fresh cycle output: persisted to cache and eligible for alerts.
    Fresh,
    /// Cache replay (cold start or fallback): never re-saved or re-alerted.
    CacheReplay,
}

enum CycleOutcome {
    Published(usize),
    RetainedPrevious,
}

pub struct Orchestrator {
    cfg: PipelineConfig,
    providers: Vec<Arc<dyn SourceProvider>>,
    validator: Validator,
    cache: CacheStore,
    sinks: Vec<Arc<dyn EventSink>>,
    alerts: AlertMux,

    running: AtomicBool,
    suspended: AtomicBool,
    degraded: AtomicBool,
    /// Mutual exclusion between cycles; `try_lock` drops overlap.
    cycle_gate: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    published_generation: AtomicU64,
    phase: Mutex<CyclePhase>,
    published: RwLock<Vec<FusedEvent>>,
    watch_tx: watch::Sender<Vec<FusedEvent>>,
    alerted: Mutex<HashSet<String>>,
    provider_health: Mutex<HashMap<&'static str, ProviderHealth>>,
    last_cycle_at_ms: AtomicI64,
}

impl Orchestrator {
    pub fn new(
        cfg: PipelineConfig,
        providers: Vec<Arc<dyn SourceProvider>>,
        validator: Validator,
        cache: CacheStore,
        sinks: Vec<Arc<dyn EventSink>>,
        alerts: AlertMux,
    ) -> Arc<Self> {
        ingest::ensure_metrics_described();
        let (watch_tx, _) = watch::channel(Vec::new());
        Arc::new(Self {
            cfg,
            providers,
            validator,
            cache,
            sinks,
            alerts,
            running: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            cycle_gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            published_generation: AtomicU64::new(0),
            phase: Mutex::new(CyclePhase::Idle),
            published: RwLock::new(Vec::new()),
            watch_tx,
            alerted: Mutex::new(HashSet::new()),
            provider_health: Mutex::new(HashMap::new()),
            last_cycle_at_ms: AtomicI64::new(0),
        })
    }

    // ---- lifecycle -------------------------------------------------------

    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("orchestrator already running");
            return None;
        }
        let this = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(this.cfg.cycle_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.run_cycle().await;
            }
            tracing::info!("orchestrator loop stopped");
        }))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Global feature switch: a suspended orchestrator skips cycles entirely.
    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
        self.set_phase(if suspended {
            CyclePhase::Suspended
        } else {
            CyclePhase::Idle
        });
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock().expect("phase lock poisoned")
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.lock().expect("phase lock poisoned") = phase;
    }

    // ---- consumer boundary ----------------------------------------------

    pub fn get_last_published(&self) -> Vec<FusedEvent> {
        self.published.read().expect("published lock poisoned").clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<FusedEvent>> {
        self.watch_tx.subscribe()
    }

    pub fn provider_health(&self) -> HashMap<&'static str, ProviderHealth> {
        self.provider_health
            .lock()
            .expect("health lock poisoned")
            .clone()
    }

    pub fn cache_age_minutes(&self) -> Option<i64> {
        self.cache.age_minutes()
    }

    pub fn last_cycle_at_ms(&self) -> Option<i64> {
        match self.last_cycle_at_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms),
        }
    }

    // ---- cycle -----------------------------------------------------------

    pub async fn run_cycle(&self) {
        if self.suspended.load(Ordering::SeqCst) {
            self.set_phase(CyclePhase::Suspended);
            return;
        }
        let Ok(_guard) = self.cycle_gate.try_lock() else {
            counter!("ingest_cycles_dropped_total").increment(1);
            tracing::debug!("cycle already in flight, dropping request");
            return;
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Cold start: the consumer gets cached data within one tick, before
        // the first network round-trip.
        if self.get_last_published().is_empty() {
            if let Some(cached) = self.cache.load() {
                tracing::info!(
                    events = cached.len(),
                    age_minutes = self.cache.age_minutes().unwrap_or(0),
                    "publishing cached set before first fetch"
                );
                self.publish(generation, cached, PublishKind::CacheReplay)
                    .await;
            }
        }

        match self.run_cycle_inner(generation).await {
            Ok(CycleOutcome::Published(count)) => {
                self.degraded.store(false, Ordering::SeqCst);
                tracing::info!(events = count, generation, "cycle published");
            }
            Ok(CycleOutcome::RetainedPrevious) => {
                self.degraded.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                // Last line of defense: no cycle error escapes the scheduler.
                tracing::error!(error = ?e, "cycle failed, attempting cache fallback");
                match self.cache.load() {
                    Some(cached) => {
                        let age_minutes = self.cache.age_minutes().unwrap_or(0);
                        let threshold =
                            (self.cfg.cache.degraded_after_hours * 60) as i64;
                        self.degraded
                            .store(age_minutes > threshold, Ordering::SeqCst);
                        self.publish(generation, cached, PublishKind::CacheReplay)
                            .await;
                    }
                    None => {
                        // Truly first run with an empty cache: "no data".
                        tracing::warn!("no cached data available for fallback");
                    }
                }
            }
        }

        self.set_phase(CyclePhase::Idle);
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.last_cycle_at_ms.store(now_ms, Ordering::SeqCst);
        gauge!("ingest_cycle_last_run_ts").set((now_ms / 1_000) as f64);
    }

    async fn run_cycle_inner(&self, generation: u64) -> anyhow::Result<CycleOutcome> {
        self.set_phase(CyclePhase::Fetching);
        let fetched = ingest::fetch_all(&self.providers).await;
        let now_ms = chrono::Utc::now().timestamp_millis();

        {
            let mut health = self.provider_health.lock().expect("health lock poisoned");
            for f in &fetched {
                let entry = health.entry(f.name).or_default();
                if f.ok {
                    entry.last_success_ms = Some(now_ms);
                    entry.error_count = 0;
                } else {
                    entry.error_count += 1;
                }
            }
        }
        if fetched.iter().all(|f| !f.ok) {
            anyhow::bail!("every provider faulted");
        }
        let raw: Vec<Event> = fetched.into_iter().flat_map(|f| f.events).collect();

        self.set_phase(CyclePhase::Normalizing);
        let (kept, _rejected) = normalize_batch(raw, now_ms, &self.cfg.trust);
        let (deduped, _removed) = dedupe(kept);
        counter!("ingest_kept_total").increment(deduped.len() as u64);

        self.set_phase(CyclePhase::Fusing);
        let per_source = group_by_source(deduped);
        let fused = fuse(per_source.clone(), &self.cfg.trust);

        self.set_phase(CyclePhase::Validating);
        let published_snapshot = self.get_last_published();
        let ctx = ValidationContext {
            published: &published_snapshot,
            per_source: &per_source,
            now_ms,
        };
        let (mut accepted, _rejected) = self.validator.validate_batch(fused, &ctx).await;

        self.set_phase(CyclePhase::Publishing);
        if accepted.is_empty() {
            // Avoid flashing consumers to empty on a bad cycle.
            tracing::info!("zero surviving events, retaining previous publish");
            return Ok(CycleOutcome::RetainedPrevious);
        }
        accepted.truncate(self.cfg.published_cap);
        let count = accepted.len();
        self.publish(generation, accepted, PublishKind::Fresh).await;
        Ok(CycleOutcome::Published(count))
    }

    async fn publish(&self, generation: u64, events: Vec<FusedEvent>, kind: PublishKind) {
        // Last-write-wins across cycles: results from a superseded cycle are
        // discarded instead of overwriting fresher output.
        let mut current = self.published_generation.load(Ordering::SeqCst);
        loop {
            if generation < current {
                tracing::warn!(generation, current, "discarding superseded cycle results");
                return;
            }
            match self.published_generation.compare_exchange(
                current,
                generation,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        *self.published.write().expect("published lock poisoned") = events.clone();
        let _ = self.watch_tx.send(events.clone());
        for sink in &self.sinks {
            sink.on_publish(&events).await;
        }

        if matches!(kind, PublishKind::Fresh) {
            if let Err(e) = self.cache.save(&events) {
                tracing::warn!(error = %e, "cache save failed");
            }
            self.forward_alerts(&events).await;
        }
    }

    /// Forward newly-published high-magnitude events, once per event id.
    async fn forward_alerts(&self, events: &[FusedEvent]) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        for fused in events {
            let event = &fused.event;
            if event.magnitude < self.cfg.alert_magnitude_threshold {
                continue;
            }
            if now_ms - event.occurred_at_ms > ALERT_MAX_AGE_MS {
                continue;
            }
            let first_time = self
                .alerted
                .lock()
                .expect("alerted lock poisoned")
                .insert(event.id.clone());
            if !first_time {
                continue;
            }
            let alert = EventAlert {
                event: fused.clone(),
                estimated_intensity: estimate_intensity(event.magnitude, 1.0),
            };
            self.alerts.notify(&alert).await;
        }
    }
}
