// src/ingest/providers/aggregator.rs
//! Third-party aggregator that republishes both observatories' feeds
//! (kandilli-rasathanesi-api). The combined `data/latest` endpoint is
//! preferred; after three consecutive failures it is disabled for the
//! process lifetime and the `data/search` POST endpoint is queried per
//! provider instead.
//!
//! Records carry a `provider` tag mapping back onto the same two canonical
//! sources, so the aggregator never counts as an independent observer of an
//! event it merely relays.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::Deserialize;

use crate::config::RegionBounds;
use crate::error::ParseError;
use crate::ingest::providers::{parse_istanbul_civil_ms, REGION_FALLBACK_LABEL};
use crate::ingest::types::{Event, SourceId, SourceProvider};
use crate::resilience::{HttpResponse, ResilienceClient};

pub const ENDPOINT_KEY: &str = "aggregator";
const BASE_URL: &str = "https://api.orhanaydogdu.com.tr/deprem";
const MAX_LATEST_FAILURES: u32 = 3;
const MAX_EVENTS: usize = 100;
const RECENCY_DAYS: i64 = 7;

#[derive(Debug, Deserialize)]
struct Envelope {
    status: bool,
    #[serde(rename = "httpStatus")]
    http_status: u16,
    #[serde(default)]
    result: Vec<RawRecord>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    earthquake_id: Option<String>,
    provider: Option<String>,
    title: Option<String>,
    mag: Option<f64>,
    depth: Option<f64>,
    geojson: Option<GeoJson>,
    date_time: Option<String>,
    location_properties: Option<LocationProps>,
}

#[derive(Debug, Deserialize)]
struct GeoJson {
    /// GeoJSON order: [longitude, latitude].
    coordinates: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct LocationProps {
    #[serde(rename = "closestCity")]
    closest_city: Option<ClosestCity>,
}

#[derive(Debug, Deserialize)]
struct ClosestCity {
    name: String,
}

enum Mode {
    Fixture(String),
    Http {
        client: reqwest::Client,
        resilience: Arc<ResilienceClient>,
    },
}

pub struct AggregatorProvider {
    mode: Mode,
    region: RegionBounds,
    latest_enabled: AtomicBool,
    latest_failures: AtomicU32,
}

impl AggregatorProvider {
    pub fn new(resilience: Arc<ResilienceClient>, region: RegionBounds) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("quake-fusion/0.1 (+github.com/lumlich/quake-fusion)")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client");
        Self {
            mode: Mode::Http { client, resilience },
            region,
            latest_enabled: AtomicBool::new(true),
            latest_failures: AtomicU32::new(0),
        }
    }

    pub fn from_fixture_str(s: &str) -> Self {
        Self {
            mode: Mode::Fixture(s.to_string()),
            region: RegionBounds::default(),
            latest_enabled: AtomicBool::new(true),
            latest_failures: AtomicU32::new(0),
        }
    }

    /// POST body for `data/search`, preserved bit-exact for interop:
    /// `{provider, match:{mag, date_starts, date_ends}, sort, limit}`.
    fn search_body(provider_tag: &str) -> serde_json::Value {
        let end = chrono::Utc::now();
        let start = end - chrono::Duration::days(RECENCY_DAYS);
        serde_json::json!({
            "provider": provider_tag,
            "match": {
                "mag": 1.0,
                "date_starts": start.format("%Y-%m-%d %H:%M:%S").to_string(),
                "date_ends": end.format("%Y-%m-%d %H:%M:%S").to_string(),
            },
            "sort": "date_-1",
            "limit": 100,
        })
    }

    pub fn parse_events_from_str(&self, s: &str) -> Result<Vec<Event>> {
        let t0 = std::time::Instant::now();
        let envelope: Envelope =
            serde_json::from_str(s).map_err(|e| ParseError::new("aggregator json", e))?;
        if !envelope.status || envelope.http_status != 200 {
            anyhow::bail!(
                "aggregator envelope rejected (status={}, httpStatus={})",
                envelope.status,
                envelope.http_status
            );
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let oldest_ms = now_ms - RECENCY_DAYS * 24 * 3_600 * 1_000;
        let total = envelope.result.len();

        let mut out = Vec::with_capacity(total);
        for record in envelope.result {
            if let Some(event) = self.canonicalize(record, oldest_ms) {
                out.push(event);
            }
        }
        out.sort_by_key(|e| std::cmp::Reverse(e.occurred_at_ms));
        out.truncate(MAX_EVENTS);

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_parse_ms").record(ms);
        counter!("ingest_events_total").increment(out.len() as u64);
        tracing::debug!(
            provider = "AGGREGATOR",
            parsed = out.len(),
            total,
            "parsed aggregator payload"
        );
        Ok(out)
    }

    fn canonicalize(&self, record: RawRecord, oldest_ms: i64) -> Option<Event> {
        let source = match record.provider.as_deref() {
            Some("kandilli") => SourceId::Kandilli,
            Some("afad") => SourceId::Afad,
            _ => return None,
        };

        let coords = record.geojson.as_ref()?.coordinates.as_slice();
        let (longitude, latitude) = match coords {
            [lon, lat, ..] => (*lon, *lat),
            _ => return None,
        };
        // Relayed reports are secondary evidence, regional box applies.
        if !self.region.contains(latitude, longitude) {
            return None;
        }

        let magnitude = record.mag?;
        if !(1.0..=10.0).contains(&magnitude) {
            return None;
        }
        let occurred_at_ms = parse_istanbul_civil_ms(record.date_time.as_deref()?)?;
        if occurred_at_ms < oldest_ms {
            return None;
        }

        let depth_km = record.depth.unwrap_or(10.0).clamp(0.0, 1000.0);
        let location = record
            .title
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                record
                    .location_properties
                    .as_ref()
                    .and_then(|lp| lp.closest_city.as_ref())
                    .map(|c| c.name.trim().to_string())
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| REGION_FALLBACK_LABEL.to_string());

        let tag = source.as_str().to_ascii_lowercase();
        let id = match record.earthquake_id.as_deref().map(str::trim) {
            Some(native) if !native.is_empty() => format!("aggregator-{tag}-{native}"),
            _ => Event::grid_id(&format!("aggregator-{tag}"), occurred_at_ms, latitude, longitude),
        };

        Some(Event {
            id,
            magnitude,
            depth_km,
            latitude,
            longitude,
            occurred_at_ms,
            location,
            source,
        })
    }

    async fn fetch_latest(
        &self,
        client: &reqwest::Client,
        resilience: &ResilienceClient,
    ) -> Result<Vec<Event>> {
        let url = format!("{BASE_URL}/data/latest");
        let resp = resilience
            .execute(ENDPOINT_KEY, &format!("GET {url}"), || {
                let client = client.clone();
                let url = url.clone();
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
        self.parse_events_from_str(&resp.body)
    }

    async fn fetch_search(
        &self,
        client: &reqwest::Client,
        resilience: &ResilienceClient,
        provider_tag: &str,
    ) -> Result<Vec<Event>> {
        let url = format!("{BASE_URL}/data/search");
        let body = Self::search_body(provider_tag);
        let body_str = body.to_string();
        let resp = resilience
            .execute(ENDPOINT_KEY, &format!("POST {url} {body_str}"), || {
                let client = client.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    let r = client
                        .post(&url)
                        .header("Accept", "application/json")
                        .json(&body)
                        .send()
                        .await?;
                    let status = r.status().as_u16();
                    let body = r.text().await?;
                    Ok(HttpResponse { status, body })
                }
            })
            .await?;
        self.parse_events_from_str(&resp.body)
    }
}

#[async_trait]
impl SourceProvider for AggregatorProvider {
    async fn fetch_recent(&self) -> Result<Vec<Event>> {
        match &self.mode {
            Mode::Fixture(s) => self.parse_events_from_str(s),
            Mode::Http { client, resilience } => {
                if self.latest_enabled.load(Ordering::Relaxed) {
                    match self.fetch_latest(client, resilience).await {
                        Ok(events) => {
                            self.latest_failures.store(0, Ordering::Relaxed);
                            return Ok(events);
                        }
                        Err(e) => {
                            let failures = self.latest_failures.fetch_add(1, Ordering::Relaxed) + 1;
                            if failures >= MAX_LATEST_FAILURES {
                                self.latest_enabled.store(false, Ordering::Relaxed);
                                tracing::info!(
                                    provider = "AGGREGATOR",
                                    failures,
                                    "latest endpoint disabled, using search only"
                                );
                            }
                            tracing::debug!(
                                error = %e,
                                provider = "AGGREGATOR",
                                "latest endpoint failed, falling back to search"
                            );
                        }
                    }
                }

                let mut events = Vec::new();
                let mut last_err = None;
                for tag in ["afad", "kandilli"] {
                    match self.fetch_search(client, resilience, tag).await {
                        Ok(mut list) => events.append(&mut list),
                        Err(e) => last_err = Some(e),
                    }
                }
                if events.is_empty() {
                    if let Some(e) = last_err {
                        return Err(e).context("aggregator search fallback");
                    }
                }
                Ok(events)
            }
        }
    }

    fn name(&self) -> &'static str {
        "AGGREGATOR"
    }
}
