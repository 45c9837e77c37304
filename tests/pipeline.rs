// tests/pipeline.rs
//! Pure pipeline stages chained the way the orchestrator runs them:
//! normalize → dedupe → fuse → validate.

use std::sync::Arc;

use quake_fusion::config::TrustPolicy;
use quake_fusion::dedup::dedupe;
use quake_fusion::fusion::fuse;
use quake_fusion::ingest::group_by_source;
use quake_fusion::ingest::types::{Event, SourceId};
use quake_fusion::normalize::normalize_batch;
use quake_fusion::validate::advisor::DisabledAdvisor;
use quake_fusion::validate::{ValidationContext, Validator};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn event(source: SourceId, id: &str, mag: f64, lat: f64, lon: f64, at_ms: i64) -> Event {
    Event {
        id: id.into(),
        magnitude: mag,
        depth_km: 7.0,
        latitude: lat,
        longitude: lon,
        occurred_at_ms: at_ms,
        location: "Körfez (Kocaeli)".into(),
        source,
    }
}

#[test]
fn same_payload_twice_yields_a_single_event() {
    let policy = TrustPolicy::default();
    let now = now_ms();
    let report = event(SourceId::Afad, "afad-1", 3.6, 39.23, 28.15, now - 120_000);

    // The same raw provider payload arriving twice in one cycle.
    let doubled = vec![report.clone(), report];
    let (kept, rejected) = normalize_batch(doubled, now, &policy);
    assert_eq!(rejected, 0);
    let (deduped, removed) = dedupe(kept);
    assert_eq!(deduped.len(), 1);
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn corroborated_occurrence_publishes_once_with_primary_figures() {
    // Provider A: {mag 5.5, 40.70, 29.10, T, Primary}
    // Provider B: {mag 5.6, 40.705, 29.105, T+10s, Secondary}
    let policy = TrustPolicy::default();
    let now = now_ms();
    let t = now - 120_000;
    let a = event(SourceId::Afad, "afad-1", 5.5, 40.70, 29.10, t);
    let b = event(SourceId::Kandilli, "kandilli-1", 5.6, 40.705, 29.105, t + 10_000);

    let (kept, _) = normalize_batch(vec![a, b], now, &policy);
    let (deduped, _) = dedupe(kept);
    assert_eq!(deduped.len(), 2); // cross-source overlap is fusion's job

    let per_source = group_by_source(deduped);
    let fused = fuse(per_source.clone(), &policy);
    assert_eq!(fused.len(), 1);
    assert_eq!(fused[0].event.magnitude, 5.5); // primary wins
    assert_eq!(fused[0].corroborating_sources.len(), 2);
    assert_eq!(fused[0].confidence, 95);

    let validator = Validator::new(policy, Arc::new(DisabledAdvisor));
    let ctx = ValidationContext {
        published: &[],
        per_source: &per_source,
        now_ms: now,
    };
    let (accepted, rejected) = validator.validate_batch(fused, &ctx).await;
    assert_eq!(accepted.len(), 1);
    assert!(rejected.is_empty());
    assert_eq!(accepted[0].confidence, 95);
}

#[tokio::test]
async fn malformed_records_never_reach_fusion() {
    let policy = TrustPolicy::default();
    let now = now_ms();

    let mut impossible = event(SourceId::Kandilli, "k-bad", 3.0, 39.0, 28.0, now - 60_000);
    impossible.latitude = 200.0;
    let ok = event(SourceId::Afad, "afad-ok", 3.0, 39.0, 28.0, now - 60_000);

    let (kept, rejected) = normalize_batch(vec![impossible, ok], now, &policy);
    assert_eq!(rejected, 1);
    let (deduped, _) = dedupe(kept);
    let per_source = group_by_source(deduped);
    let fused = fuse(per_source.clone(), &policy);
    assert_eq!(fused.len(), 1);
    assert_eq!(fused[0].event.id, "afad-ok");
}

#[test]
fn uncorroborated_secondary_report_stays_separate_and_lower_confidence() {
    let policy = TrustPolicy::default();
    let now = now_ms();
    let a = event(SourceId::Afad, "afad-1", 5.5, 40.70, 29.10, now - 120_000);
    // Same moment, hundreds of kilometres away: different occurrence.
    let b = event(SourceId::Kandilli, "kandilli-1", 4.0, 37.0, 36.0, now - 110_000);

    let (kept, _) = normalize_batch(vec![a, b], now, &policy);
    let (deduped, _) = dedupe(kept);
    let fused = fuse(group_by_source(deduped), &policy);

    assert_eq!(fused.len(), 2);
    let secondary = fused.iter().find(|f| f.event.id == "kandilli-1").unwrap();
    assert_eq!(secondary.confidence, 70);
    let primary = fused.iter().find(|f| f.event.id == "afad-1").unwrap();
    assert_eq!(primary.confidence, 80);
}

#[tokio::test]
async fn published_duplicate_under_a_new_id_is_rejected_for_secondary() {
    let policy = TrustPolicy::default();
    let now = now_ms();
    let published_event = event(SourceId::Afad, "afad-1", 4.0, 39.0, 28.0, now - 300_000);
    let published = vec![quake_fusion::ingest::types::FusedEvent::single(
        published_event,
        95,
    )];

    // Next cycle: a secondary source re-reports the same occurrence under a
    // fresh id.
    let rerun = event(SourceId::Kandilli, "kandilli-9", 4.05, 39.001, 28.001, now - 295_000);
    let (kept, _) = normalize_batch(vec![rerun], now, &policy);
    let (deduped, _) = dedupe(kept);
    let per_source = group_by_source(deduped.clone());
    let fused = fuse(per_source.clone(), &policy);

    let validator = Validator::new(policy, Arc::new(DisabledAdvisor));
    let ctx = ValidationContext {
        published: &published,
        per_source: &per_source,
        now_ms: now,
    };
    let (accepted, rejected) = validator.validate_batch(fused, &ctx).await;
    assert!(accepted.is_empty());
    assert_eq!(rejected.len(), 1);
}
