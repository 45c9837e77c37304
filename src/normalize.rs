// src/normalize.rs
//! Record normalizer: coerces raw provider events into well-formed canonical
//! events and rejects malformed ones. Pure, no suspension points.

use metrics::counter;

use crate::config::TrustPolicy;
use crate::error::RejectReason;
use crate::ingest::types::Event;

/// Clean a free-text location label: decode HTML entities, strip stray tags,
/// collapse whitespace, cap length.
pub fn clean_label(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > 120 {
        out = out.chars().take(120).collect();
    }
    out
}

/// Validate and coerce one raw event. The primary authority gets the wider
/// past tolerance from the trust policy; hard range checks apply to all.
pub fn normalize(mut event: Event, now_ms: i64, policy: &TrustPolicy) -> Result<Event, RejectReason> {
    if !event.magnitude.is_finite() || !(0.0..=10.0).contains(&event.magnitude) {
        return Err(RejectReason::MagnitudeOutOfRange);
    }
    if !event.depth_km.is_finite() || !(0.0..=1000.0).contains(&event.depth_km) {
        return Err(RejectReason::DepthOutOfRange);
    }
    if !event.latitude.is_finite()
        || !event.longitude.is_finite()
        || !(-90.0..=90.0).contains(&event.latitude)
        || !(-180.0..=180.0).contains(&event.longitude)
    {
        return Err(RejectReason::CoordinatesOutOfRange);
    }

    event.location = clean_label(&event.location);
    if event.location.is_empty() {
        return Err(RejectReason::EmptyLocation);
    }

    if event.occurred_at_ms <= 0 {
        return Err(RejectReason::UnparseableTimestamp);
    }
    let delta_ms = event.occurred_at_ms - now_ms;
    if delta_ms > (policy.max_future_secs as i64) * 1_000 {
        return Err(RejectReason::TimestampInFuture);
    }
    if -delta_ms > (policy.max_past_secs(event.source) as i64) * 1_000 {
        return Err(RejectReason::TimestampTooOld);
    }

    Ok(event)
}

/// Batch entry point. Rejections are counted and logged at low severity;
/// nothing propagates.
pub fn normalize_batch(
    events: Vec<Event>,
    now_ms: i64,
    policy: &TrustPolicy,
) -> (Vec<Event>, usize) {
    let mut kept = Vec::with_capacity(events.len());
    let mut rejected = 0usize;
    for event in events {
        let id = event.id.clone();
        match normalize(event, now_ms, policy) {
            Ok(ev) => kept.push(ev),
            Err(reason) => {
                rejected += 1;
                tracing::debug!(event = %id, %reason, "normalizer rejected record");
            }
        }
    }
    counter!("ingest_rejected_total").increment(rejected as u64);
    (kept, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::SourceId;

    const NOW_MS: i64 = 1_760_000_000_000;

    fn event(source: SourceId) -> Event {
        Event {
            id: "t-1".into(),
            magnitude: 3.2,
            depth_km: 9.0,
            latitude: 39.2,
            longitude: 28.2,
            occurred_at_ms: NOW_MS - 60_000,
            location: "Sındırgı (Balıkesir)".into(),
            source,
        }
    }

    #[test]
    fn well_formed_event_passes_through() {
        let policy = TrustPolicy::default();
        let out = normalize(event(SourceId::Afad), NOW_MS, &policy).unwrap();
        assert_eq!(out.location, "Sındırgı (Balıkesir)");
    }

    #[test]
    fn impossible_latitude_is_rejected_regardless_of_source() {
        let policy = TrustPolicy::default();
        for source in [SourceId::Afad, SourceId::Kandilli] {
            let mut ev = event(source);
            ev.latitude = 200.0;
            assert_eq!(
                normalize(ev, NOW_MS, &policy),
                Err(RejectReason::CoordinatesOutOfRange)
            );
        }
    }

    #[test]
    fn magnitude_and_depth_ranges_are_hard() {
        let policy = TrustPolicy::default();
        let mut ev = event(SourceId::Afad);
        ev.magnitude = 10.5;
        assert_eq!(
            normalize(ev, NOW_MS, &policy),
            Err(RejectReason::MagnitudeOutOfRange)
        );
        let mut ev = event(SourceId::Afad);
        ev.depth_km = 1200.0;
        assert_eq!(
            normalize(ev, NOW_MS, &policy),
            Err(RejectReason::DepthOutOfRange)
        );
        let mut ev = event(SourceId::Afad);
        ev.magnitude = f64::NAN;
        assert_eq!(
            normalize(ev, NOW_MS, &policy),
            Err(RejectReason::MagnitudeOutOfRange)
        );
    }

    #[test]
    fn primary_gets_wider_past_tolerance_than_secondary() {
        let policy = TrustPolicy::default();
        let ten_days_ago = NOW_MS - 10 * 24 * 3_600 * 1_000;

        let mut primary = event(SourceId::Afad);
        primary.occurred_at_ms = ten_days_ago;
        assert!(normalize(primary, NOW_MS, &policy).is_ok());

        let mut secondary = event(SourceId::Kandilli);
        secondary.occurred_at_ms = ten_days_ago;
        assert_eq!(
            normalize(secondary, NOW_MS, &policy),
            Err(RejectReason::TimestampTooOld)
        );
    }

    #[test]
    fn future_tolerance_is_one_hour_for_everyone() {
        let policy = TrustPolicy::default();
        let mut ev = event(SourceId::Afad);
        ev.occurred_at_ms = NOW_MS + 2 * 3_600 * 1_000;
        assert_eq!(
            normalize(ev, NOW_MS, &policy),
            Err(RejectReason::TimestampInFuture)
        );

        let mut ev = event(SourceId::Afad);
        ev.occurred_at_ms = NOW_MS + 30 * 60 * 1_000;
        assert!(normalize(ev, NOW_MS, &policy).is_ok());
    }

    #[test]
    fn labels_are_cleaned_and_empty_labels_rejected() {
        let policy = TrustPolicy::default();
        let mut ev = event(SourceId::Afad);
        ev.location = "  <b>S&#305;nd&#305;rg&#305;</b>&nbsp;&nbsp;(Bal&#305;kesir) ".into();
        let out = normalize(ev, NOW_MS, &policy).unwrap();
        assert_eq!(out.location, "Sındırgı (Balıkesir)");

        let mut ev = event(SourceId::Afad);
        ev.location = " <i></i> ".into();
        assert_eq!(normalize(ev, NOW_MS, &policy), Err(RejectReason::EmptyLocation));
    }

    #[test]
    fn batch_partitions_and_counts() {
        let policy = TrustPolicy::default();
        let mut bad = event(SourceId::Kandilli);
        bad.longitude = 999.0;
        let (kept, rejected) =
            normalize_batch(vec![event(SourceId::Afad), bad], NOW_MS, &policy);
        assert_eq!(kept.len(), 1);
        assert_eq!(rejected, 1);
    }
}
