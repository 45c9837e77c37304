// tests/providers_afad.rs
use quake_fusion::ingest::providers::afad_api::AfadApiProvider;
use quake_fusion::ingest::providers::afad_html::AfadHtmlProvider;
use quake_fusion::ingest::types::{SourceId, SourceProvider};

#[tokio::test]
async fn api_fixture_parses_skips_and_sorts() {
    let provider = AfadApiProvider::from_fixture_str(include_str!("fixtures/afad_api.json"));
    let events = provider.fetch_recent().await.unwrap();

    // 4 raw records, one without a magnitude.
    assert_eq!(events.len(), 3);
    assert!(events
        .windows(2)
        .all(|w| w[0].occurred_at_ms >= w[1].occurred_at_ms));
    assert!(events.iter().all(|e| e.source == SourceId::Afad));
    assert_eq!(events[0].id, "afad-550123");
    // Alternate field spellings coalesce into the same shape.
    assert_eq!(events[2].id, "afad-550120");
    assert_eq!(events[2].depth_km, 11.0);
    assert_eq!(events[2].location, "Elazığ");
}

#[tokio::test]
async fn api_timestamps_convert_from_istanbul_civil_time() {
    let provider = AfadApiProvider::from_fixture_str(include_str!("fixtures/afad_api.json"));
    let events = provider.fetch_recent().await.unwrap();

    // 23:18:21 Istanbul == 20:18:21 UTC.
    let utc =
        time::OffsetDateTime::from_unix_timestamp(events[0].occurred_at_ms / 1000).unwrap();
    assert_eq!((utc.hour(), utc.minute(), utc.second()), (20, 18, 21));
}

#[tokio::test]
async fn api_garbage_payload_is_an_error_not_a_panic() {
    let provider = AfadApiProvider::from_fixture_str("<html>gateway timeout</html>");
    assert!(provider.fetch_recent().await.is_err());
}

#[tokio::test]
async fn html_fixture_survives_layout_drift() {
    let provider = AfadHtmlProvider::from_fixture_str(include_str!("fixtures/afad_table.html"));
    let events = provider.fetch_recent().await.unwrap();

    // 5 rows: one with a drifted date format, one with a non-numeric
    // latitude. Both are skipped silently.
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.source == SourceId::Afad));
    assert!(events.iter().all(|e| e.id.starts_with("afad-html-")));

    // HTML entities in labels are decoded.
    assert!(events
        .iter()
        .any(|e| e.location == "Sındırgı (Balıkesir)"));
}

#[tokio::test]
async fn html_and_api_report_the_same_occurrence_consistently() {
    let api = AfadApiProvider::from_fixture_str(include_str!("fixtures/afad_api.json"));
    let html = AfadHtmlProvider::from_fixture_str(include_str!("fixtures/afad_table.html"));
    let api_events = api.fetch_recent().await.unwrap();
    let html_events = html.fetch_recent().await.unwrap();

    // The 23:18:21 Sındırgı event appears in both transports with the same
    // canonical timestamp, so dedupe/fusion can recognize the overlap.
    let a = &api_events[0];
    let h = html_events
        .iter()
        .find(|e| e.magnitude == 3.6)
        .expect("scraped counterpart");
    assert_eq!(a.occurred_at_ms, h.occurred_at_ms);
    assert!((a.latitude - h.latitude).abs() < 0.02);
}
