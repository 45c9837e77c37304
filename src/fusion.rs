// src/fusion.rs
//! Fusion engine: merges events describing the same physical occurrence
//! across *different* sources into a single authoritative record tagged with
//! every corroborating source.
//!
//! The fused set is seeded from the primary authority; every other source's
//! events either corroborate an existing record (raising confidence, never
//! lowering it) or enter as new uncorroborated records. When a primary
//! report matches a record seeded by a secondary source, the officially
//! issued figures supersede the secondary estimates.

use std::collections::BTreeMap;

use crate::config::TrustPolicy;
use crate::ingest::types::{Event, FusedEvent, SourceId};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance (Haversine).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

fn is_match(fused: &FusedEvent, event: &Event, policy: &TrustPolicy) -> bool {
    // Only *different* sources corroborate; same-source overlap is the
    // deduplicator's concern and never merges here.
    if fused.corroborating_sources.contains(&event.source) {
        return false;
    }
    let time_delta_ms = (fused.event.occurred_at_ms - event.occurred_at_ms).abs();
    if time_delta_ms > (policy.fuse_time_delta_secs as i64) * 1_000 {
        return false;
    }
    if (fused.event.magnitude - event.magnitude).abs() > policy.fuse_magnitude_tolerance {
        return false;
    }
    haversine_km(
        fused.event.latitude,
        fused.event.longitude,
        event.latitude,
        event.longitude,
    ) <= policy.fuse_distance_km
}

fn absorb(fused: &mut FusedEvent, event: Event, policy: &TrustPolicy) {
    fused.corroborating_sources.insert(event.source);
    // Corroboration only ever raises confidence.
    fused.confidence = fused.confidence.max(policy.corroborated_confidence);

    if policy.is_primary(event.source) && !policy.is_primary(fused.event.source) {
        // Officially issued figures supersede secondary estimates.
        fused.event.id = event.id;
        fused.event.magnitude = event.magnitude;
        fused.event.depth_km = event.depth_km;
        fused.event.location = event.location;
        fused.event.source = event.source;
    }
}

/// Merge per-source event lists into one fused, most-recent-first feed.
/// Input and iteration order are normalized (BTreeMap), so the result does
/// not depend on the order sources were fetched in.
pub fn fuse(
    mut per_source: BTreeMap<SourceId, Vec<Event>>,
    policy: &TrustPolicy,
) -> Vec<FusedEvent> {
    let mut fused: Vec<FusedEvent> = Vec::new();

    if let Some(primary_events) = per_source.remove(&policy.primary_source) {
        for event in primary_events {
            fused.push(FusedEvent::single(event, policy.seed_confidence));
        }
    }

    for (_source, events) in per_source {
        for event in events {
            match fused.iter_mut().find(|f| is_match(f, &event, policy)) {
                Some(slot) => absorb(slot, event, policy),
                None => fused.push(FusedEvent::single(event, policy.uncorroborated_confidence)),
            }
        }
    }

    fused.sort_by_key(|f| std::cmp::Reverse(f.event.occurred_at_ms));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(source: SourceId, id: &str, mag: f64, lat: f64, lon: f64, at_ms: i64) -> Event {
        Event {
            id: id.into(),
            magnitude: mag,
            depth_km: 7.0,
            latitude: lat,
            longitude: lon,
            occurred_at_ms: at_ms,
            location: format!("{source} report"),
            source,
        }
    }

    fn per_source(lists: Vec<Vec<Event>>) -> BTreeMap<SourceId, Vec<Event>> {
        let mut map: BTreeMap<SourceId, Vec<Event>> = BTreeMap::new();
        for list in lists {
            for ev in list {
                map.entry(ev.source).or_default().push(ev);
            }
        }
        map
    }

    #[test]
    fn corroborating_reports_fuse_to_one_record_with_primary_figures() {
        let policy = TrustPolicy::default();
        let t = 1_760_000_000_000;
        let primary = event(SourceId::Afad, "afad-1", 5.5, 40.70, 29.10, t);
        let secondary = event(SourceId::Kandilli, "kandilli-1", 5.6, 40.705, 29.105, t + 10_000);

        let fused = fuse(per_source(vec![vec![primary], vec![secondary]]), &policy);
        assert_eq!(fused.len(), 1);
        let f = &fused[0];
        assert_eq!(f.event.magnitude, 5.5);
        assert_eq!(f.event.id, "afad-1");
        assert_eq!(f.confidence, 95);
        assert!(f.corroborating_sources.contains(&SourceId::Afad));
        assert!(f.corroborating_sources.contains(&SourceId::Kandilli));
    }

    #[test]
    fn fusion_is_source_order_independent() {
        let policy = TrustPolicy::default();
        let t = 1_760_000_000_000;
        let a = event(SourceId::Afad, "afad-1", 5.5, 40.70, 29.10, t);
        let b = event(SourceId::Kandilli, "kandilli-1", 5.6, 40.705, 29.105, t + 10_000);

        let ab = fuse(per_source(vec![vec![a.clone()], vec![b.clone()]]), &policy);
        let ba = fuse(per_source(vec![vec![b], vec![a]]), &policy);
        assert_eq!(ab, ba);
    }

    #[test]
    fn primary_figures_supersede_a_secondary_seeded_record() {
        let policy = TrustPolicy::default();
        let t = 1_760_000_000_000;
        let mut fused = FusedEvent::single(
            event(SourceId::Kandilli, "kandilli-1", 5.6, 40.705, 29.105, t),
            policy.uncorroborated_confidence,
        );

        absorb(
            &mut fused,
            event(SourceId::Afad, "afad-9", 5.5, 40.70, 29.10, t + 5_000),
            &policy,
        );
        assert_eq!(fused.event.id, "afad-9");
        assert_eq!(fused.event.magnitude, 5.5);
        assert_eq!(fused.event.source, SourceId::Afad);
        assert_eq!(fused.confidence, 95);
        assert_eq!(fused.corroborating_sources.len(), 2);
    }

    #[test]
    fn confidence_never_decreases_when_sources_are_added() {
        let policy = TrustPolicy::default();
        let t = 1_760_000_000_000;
        let primary = event(SourceId::Afad, "afad-1", 4.0, 39.0, 28.0, t);

        let alone = fuse(per_source(vec![vec![primary.clone()]]), &policy);
        let with_second = fuse(
            per_source(vec![
                vec![primary],
                vec![event(SourceId::Kandilli, "k-1", 4.1, 39.001, 28.001, t + 5_000)],
            ]),
            &policy,
        );
        assert!(with_second[0].confidence >= alone[0].confidence);
    }

    #[test]
    fn non_matching_reports_enter_uncorroborated() {
        let policy = TrustPolicy::default();
        let t = 1_760_000_000_000;
        let primary = event(SourceId::Afad, "afad-1", 5.5, 40.70, 29.10, t);
        // 300+ km away: a different occurrence.
        let far = event(SourceId::Kandilli, "k-1", 5.5, 37.0, 31.0, t + 5_000);

        let fused = fuse(per_source(vec![vec![primary], vec![far]]), &policy);
        assert_eq!(fused.len(), 2);
        let uncorroborated = fused.iter().find(|f| f.event.id == "k-1").unwrap();
        assert_eq!(uncorroborated.confidence, 70);
        assert_eq!(uncorroborated.corroborating_sources.len(), 1);
    }

    #[test]
    fn output_is_most_recent_first() {
        let policy = TrustPolicy::default();
        let t = 1_760_000_000_000;
        let older = event(SourceId::Afad, "afad-1", 3.0, 39.0, 28.0, t - 600_000);
        let newer = event(SourceId::Afad, "afad-2", 2.0, 38.0, 27.0, t);
        let fused = fuse(per_source(vec![vec![older, newer]]), &policy);
        assert_eq!(fused[0].event.id, "afad-2");
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Istanbul to Ankara is roughly 350 km.
        let d = haversine_km(41.0082, 28.9784, 39.9334, 32.8597);
        assert!((300.0..400.0).contains(&d), "got {d}");
    }
}
