// tests/providers_aggregator.rs
use quake_fusion::ingest::providers::aggregator::AggregatorProvider;
use quake_fusion::ingest::types::{SourceId, SourceProvider};

/// Civil Istanbul timestamp (UTC+3) a given number of minutes ago, in the
/// aggregator's `date_time` format.
fn civil_minutes_ago(minutes: i64) -> String {
    (chrono::Utc::now() + chrono::Duration::hours(3) - chrono::Duration::minutes(minutes))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn payload(records: &[String]) -> String {
    format!(
        r#"{{"status": true, "httpStatus": 200, "result": [{}], "metadata": {{"total": {}, "count": {}}}}}"#,
        records.join(","),
        records.len(),
        records.len()
    )
}

fn record(provider: &str, id: &str, mag: f64, lon: f64, lat: f64, minutes_ago: i64) -> String {
    format!(
        r#"{{"earthquake_id": "{id}", "provider": "{provider}",
            "title": "SINDIRGI (BALIKESIR)", "mag": {mag}, "depth": 7.0,
            "geojson": {{"type": "Point", "coordinates": [{lon}, {lat}]}},
            "date_time": "{date_time}",
            "location_properties": {{"closestCity": {{"name": "Balıkesir", "cityCode": 10, "distance": 12000}}}}}}"#,
        date_time = civil_minutes_ago(minutes_ago)
    )
}

#[tokio::test]
async fn both_provider_tags_map_onto_canonical_sources() {
    let body = payload(&[
        record("afad", "a1", 3.6, 28.1547, 39.23, 5),
        record("kandilli", "k1", 3.5, 28.1785, 39.2353, 6),
    ]);
    let provider = AggregatorProvider::from_fixture_str(&body);
    let events = provider.fetch_recent().await.unwrap();

    assert_eq!(events.len(), 2);
    let afad = events.iter().find(|e| e.source == SourceId::Afad).unwrap();
    let kandilli = events.iter().find(|e| e.source == SourceId::Kandilli).unwrap();
    assert_eq!(afad.id, "aggregator-afad-a1");
    assert_eq!(kandilli.id, "aggregator-kandilli-k1");
}

#[tokio::test]
async fn geojson_order_and_regional_box_are_honored() {
    let body = payload(&[
        // [lon, lat]: a record that would pass only if the order is read
        // correctly (lat 39, lon 28 — reversed it would be rejected).
        record("afad", "ok", 2.5, 28.0, 39.0, 5),
        // Plausible-looking but outside the regional box.
        record("kandilli", "far", 5.0, 12.3, 52.1, 5),
    ]);
    let provider = AggregatorProvider::from_fixture_str(&body);
    let events = provider.fetch_recent().await.unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].latitude, 39.0);
    assert_eq!(events[0].longitude, 28.0);
}

#[tokio::test]
async fn stale_records_beyond_the_search_window_are_dropped() {
    let body = payload(&[
        record("afad", "fresh", 2.5, 28.0, 39.0, 30),
        record("afad", "stale", 2.5, 28.0, 39.0, 9 * 24 * 60),
    ]);
    let provider = AggregatorProvider::from_fixture_str(&body);
    let events = provider.fetch_recent().await.unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "aggregator-afad-fresh");
}

#[tokio::test]
async fn rejected_envelope_is_an_error() {
    let provider = AggregatorProvider::from_fixture_str(
        r#"{"status": false, "httpStatus": 503, "result": []}"#,
    );
    assert!(provider.fetch_recent().await.is_err());
}
