// src/ingest/mod.rs
pub mod providers;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

use crate::ingest::types::{Event, SourceId, SourceProvider};

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_events_total", "Total events parsed from providers.");
        describe_counter!(
            "ingest_kept_total",
            "Events kept after normalization + deduplication."
        );
        describe_counter!(
            "ingest_rejected_total",
            "Events rejected by the normalizer."
        );
        describe_counter!(
            "ingest_dedup_total",
            "Events removed as same-source duplicates."
        );
        describe_counter!(
            "ingest_provider_errors_total",
            "Provider fetch/parse errors."
        );
        describe_counter!(
            "ingest_cycles_dropped_total",
            "Cycles dropped because one was already in flight."
        );
        describe_counter!(
            "validator_accepted_total",
            "Fused events accepted by the validator."
        );
        describe_counter!(
            "validator_rejected_total",
            "Fused events rejected by the validator."
        );
        describe_histogram!("ingest_parse_ms", "Provider parse time in milliseconds.");
        describe_gauge!(
            "ingest_cycle_last_run_ts",
            "Unix ts when the ingestion cycle last ran."
        );
    });
}

/// Outcome of one provider's fetch within a cycle.
pub struct ProviderFetch {
    pub name: &'static str,
    pub events: Vec<Event>,
    pub ok: bool,
}

/// Fan out one fetch across all providers concurrently and wait for every
/// one to settle. A failed provider contributes an empty list plus a
/// diagnostic; slow or failed providers never block the others beyond their
/// own bounded timeouts.
pub async fn fetch_all(providers: &[Arc<dyn SourceProvider>]) -> Vec<ProviderFetch> {
    ensure_metrics_described();

    let futures = providers.iter().map(|p| {
        let provider = p.clone();
        async move {
            let name = provider.name();
            match provider.fetch_recent().await {
                Ok(events) => ProviderFetch {
                    name,
                    events,
                    ok: true,
                },
                Err(e) => {
                    tracing::warn!(error = ?e, provider = name, "provider error");
                    counter!("ingest_provider_errors_total").increment(1);
                    ProviderFetch {
                        name,
                        events: Vec::new(),
                        ok: false,
                    }
                }
            }
        }
    });
    futures::future::join_all(futures).await
}

/// Group a flat event list by reporting source for the fusion stage.
pub fn group_by_source(events: Vec<Event>) -> BTreeMap<SourceId, Vec<Event>> {
    let mut per_source: BTreeMap<SourceId, Vec<Event>> = BTreeMap::new();
    for event in events {
        per_source.entry(event.source).or_default().push(event);
    }
    per_source
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};

    struct FixedProvider(Vec<Event>);

    #[async_trait::async_trait]
    impl SourceProvider for FixedProvider {
        async fn fetch_recent(&self) -> Result<Vec<Event>> {
            Ok(self.0.clone())
        }
        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    struct FailingProvider;

    #[async_trait::async_trait]
    impl SourceProvider for FailingProvider {
        async fn fetch_recent(&self) -> Result<Vec<Event>> {
            Err(anyhow!("upstream down"))
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn event(source: SourceId) -> Event {
        Event {
            id: "x".into(),
            magnitude: 2.0,
            depth_km: 10.0,
            latitude: 39.0,
            longitude: 28.0,
            occurred_at_ms: 1_700_000_000_000,
            location: "Test".into(),
            source,
        }
    }

    #[tokio::test]
    async fn failures_become_empty_fetches() {
        let providers: Vec<Arc<dyn SourceProvider>> = vec![
            Arc::new(FixedProvider(vec![event(SourceId::Afad)])),
            Arc::new(FailingProvider),
        ];
        let fetched = fetch_all(&providers).await;
        assert_eq!(fetched.len(), 2);
        assert!(fetched[0].ok);
        assert_eq!(fetched[0].events.len(), 1);
        assert!(!fetched[1].ok);
        assert!(fetched[1].events.is_empty());
    }

    #[test]
    fn grouping_is_per_source() {
        let grouped = group_by_source(vec![
            event(SourceId::Afad),
            event(SourceId::Kandilli),
            event(SourceId::Afad),
        ]);
        assert_eq!(grouped[&SourceId::Afad].len(), 2);
        assert_eq!(grouped[&SourceId::Kandilli].len(), 1);
    }
}
