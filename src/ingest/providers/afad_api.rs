// src/ingest/providers/afad_api.rs
//! Official AFAD event REST API (primary authority). Queries a 7-day filter
//! window and falls back to the `latest` endpoint when the filter query
//! fails. Records keep AFAD's own plausibility decisions: no regional box is
//! applied here, only structural checks; the normalizer enforces ranges.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::Deserialize;

use crate::error::{FetchError, ParseError};
use crate::ingest::providers::{parse_istanbul_civil_ms, NumOrStr, REGION_FALLBACK_LABEL};
use crate::ingest::types::{Event, SourceId, SourceProvider};
use crate::resilience::{HttpResponse, ResilienceClient};

pub const ENDPOINT_KEY: &str = "afad-api";
const FILTER_URL: &str = "https://deprem.afad.gov.tr/apiv2/event/filter";
const LATEST_URL: &str = "https://deprem.afad.gov.tr/apiv2/event/latest?limit=500";
const MAX_EVENTS: usize = 100;

/// AFAD payloads drift between field spellings; the alternates are declared
/// explicitly and records missing a required field are skipped, never guessed.
#[derive(Debug, Deserialize)]
struct RawAfadEvent {
    #[serde(rename = "eventID", alias = "eventId", alias = "id")]
    event_id: Option<NumOrStr>,
    #[serde(rename = "eventDate", alias = "date", alias = "originTime")]
    event_date: Option<String>,
    #[serde(alias = "magnitude", alias = "ml")]
    mag: Option<NumOrStr>,
    #[serde(alias = "lat")]
    latitude: Option<NumOrStr>,
    #[serde(alias = "lon", alias = "lng")]
    longitude: Option<NumOrStr>,
    #[serde(alias = "derinlik")]
    depth: Option<NumOrStr>,
    location: Option<String>,
    #[serde(alias = "place")]
    title: Option<String>,
}

enum Mode {
    Fixture(String),
    Http {
        client: reqwest::Client,
        resilience: Arc<ResilienceClient>,
    },
}

pub struct AfadApiProvider {
    mode: Mode,
}

impl AfadApiProvider {
    pub fn new(resilience: Arc<ResilienceClient>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("quake-fusion/0.1 (+github.com/lumlich/quake-fusion)")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client");
        Self {
            mode: Mode::Http { client, resilience },
        }
    }

    pub fn from_fixture_str(s: &str) -> Self {
        Self {
            mode: Mode::Fixture(s.to_string()),
        }
    }

    fn filter_url_for_last_week() -> String {
        let end = chrono::Utc::now();
        let start = end - chrono::Duration::days(7);
        format!(
            "{FILTER_URL}?start={}&end={}&minmag=1&limit=500",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        )
    }

    pub fn parse_events_from_str(s: &str) -> Result<Vec<Event>> {
        let t0 = std::time::Instant::now();
        let raw: Vec<RawAfadEvent> =
            serde_json::from_str(s).map_err(|e| ParseError::new("afad event json", e))?;

        let total = raw.len();
        let mut out = Vec::with_capacity(total);
        for item in raw {
            if let Some(event) = canonicalize(item) {
                out.push(event);
            }
        }
        // The API may return unsorted data.
        out.sort_by_key(|e| std::cmp::Reverse(e.occurred_at_ms));
        out.truncate(MAX_EVENTS);

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_parse_ms").record(ms);
        counter!("ingest_events_total").increment(out.len() as u64);
        tracing::debug!(
            provider = "AFAD-API",
            parsed = out.len(),
            total,
            "parsed afad api payload"
        );
        Ok(out)
    }

    async fn get_body(
        client: &reqwest::Client,
        resilience: &ResilienceClient,
        url: &str,
    ) -> Result<String, FetchError> {
        let resp = resilience
            .execute(ENDPOINT_KEY, &format!("GET {url}"), || {
                let client = client.clone();
                let url = url.to_string();
                async move {
                    let r = client
                        .get(&url)
                        .header("Accept", "application/json")
                        .header("Cache-Control", "no-cache")
                        .send()
                        .await?;
                    let status = r.status().as_u16();
                    let body = r.text().await?;
                    Ok(HttpResponse { status, body })
                }
            })
            .await?;
        Ok(resp.body)
    }
}

fn canonicalize(item: RawAfadEvent) -> Option<Event> {
    let magnitude = item.mag.as_ref()?.as_f64()?;
    let latitude = item.latitude.as_ref()?.as_f64()?;
    let longitude = item.longitude.as_ref()?.as_f64()?;
    let occurred_at_ms = parse_istanbul_civil_ms(item.event_date.as_deref()?)?;
    let depth_km = item
        .depth
        .as_ref()
        .and_then(|d| d.as_f64())
        .unwrap_or(10.0)
        .clamp(0.0, 1000.0);

    let location = [item.location.as_deref(), item.title.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(REGION_FALLBACK_LABEL)
        .to_string();

    let id = match item.event_id {
        Some(native) => format!("afad-{}", native.as_string()),
        None => Event::grid_id("afad", occurred_at_ms, latitude, longitude),
    };

    Some(Event {
        id,
        magnitude,
        depth_km,
        latitude,
        longitude,
        occurred_at_ms,
        location,
        source: SourceId::Afad,
    })
}

#[async_trait]
impl SourceProvider for AfadApiProvider {
    async fn fetch_recent(&self) -> Result<Vec<Event>> {
        match &self.mode {
            Mode::Fixture(s) => Self::parse_events_from_str(s),
            Mode::Http { client, resilience } => {
                let url = Self::filter_url_for_last_week();
                let body = match Self::get_body(client, resilience, &url).await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            provider = "AFAD-API",
                            "filter endpoint failed, trying latest"
                        );
                        Self::get_body(client, resilience, LATEST_URL)
                            .await
                            .context("afad latest endpoint")?
                    }
                };
                Self::parse_events_from_str(&body)
            }
        }
    }

    fn name(&self) -> &'static str {
        "AFAD-API"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_missing_required_fields_are_skipped() {
        let payload = r#"[
            {"eventID": "550001", "eventDate": "2025-11-10T22:27:06", "mag": "4.2",
             "latitude": "39.23", "longitude": "28.15", "depth": "7.1", "location": "Sındırgı (Balıkesir)"},
            {"eventID": "550002", "eventDate": "2025-11-10T21:00:00",
             "latitude": "39.0", "longitude": "28.0", "location": "no magnitude"},
            {"eventID": "550003", "mag": 3.0, "latitude": 39.0, "longitude": 28.0,
             "location": "no date"}
        ]"#;
        let events = AfadApiProvider::parse_events_from_str(payload).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "afad-550001");
        assert_eq!(events[0].magnitude, 4.2);
        assert_eq!(events[0].source, SourceId::Afad);
    }

    #[test]
    fn alternate_field_spellings_coalesce() {
        let payload = r#"[
            {"id": 7, "date": "2025-11-10 12:00:00", "ml": 2.4,
             "lat": 38.5, "lng": 27.1, "derinlik": "12.0", "title": "Ege Denizi"}
        ]"#;
        let events = AfadApiProvider::parse_events_from_str(payload).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].depth_km, 12.0);
        assert_eq!(events[0].location, "Ege Denizi");
    }

    #[test]
    fn missing_label_falls_back_to_region() {
        let payload = r#"[
            {"eventID": "9", "eventDate": "2025-11-10T10:00:00", "mag": 1.8,
             "latitude": 38.0, "longitude": 27.0, "location": "   "}
        ]"#;
        let events = AfadApiProvider::parse_events_from_str(payload).unwrap();
        assert_eq!(events[0].location, REGION_FALLBACK_LABEL);
    }
}
