// src/ingest/providers/afad_html.rs
//! Scrape of the rendered AFAD "last earthquakes" table, used when the
//! structured API is unavailable. The page layout drifts, so every row is
//! validated against exact field shapes and malformed rows are skipped
//! silently instead of aborting the whole page.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::error::ParseError;
use crate::ingest::providers::parse_istanbul_civil_ms;
use crate::ingest::types::{Event, SourceId, SourceProvider};
use crate::resilience::{HttpResponse, ResilienceClient};

pub const ENDPOINT_KEY: &str = "afad-html";
const PAGE_URL: &str = "https://deprem.afad.gov.tr/last-earthquakes.html";
const MAX_EVENTS: usize = 100;

// Browser-like UA: the page refuses obvious bot agents.
const SCRAPE_USER_AGENT: &str =
    "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/605.1.15";

fn re_tbody() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)<tbody>(.*?)</tbody>").unwrap())
}

fn re_table() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)<table[^>]*>(.*?)</table>").unwrap())
}

fn re_row() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").unwrap())
}

fn re_cell() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)<td[^>]*>(.*?)</td>").unwrap())
}

fn re_tags() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap())
}

fn re_date_shape() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}$").unwrap())
}

enum Mode {
    Fixture(String),
    Http {
        client: reqwest::Client,
        resilience: Arc<ResilienceClient>,
    },
}

pub struct AfadHtmlProvider {
    mode: Mode,
}

impl AfadHtmlProvider {
    pub fn new(resilience: Arc<ResilienceClient>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(SCRAPE_USER_AGENT)
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
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

    pub fn parse_events_from_html(html: &str) -> Result<Vec<Event>> {
        let t0 = std::time::Instant::now();

        let body = re_tbody()
            .captures(html)
            .or_else(|| re_table().captures(html))
            .map(|c| c.get(1).map(|m| m.as_str()).unwrap_or_default())
            .ok_or_else(|| ParseError::new("afad html table", "no <tbody> or <table> found"))?;

        let mut out = Vec::new();
        for row in re_row().captures_iter(body) {
            let row = row.get(1).map(|m| m.as_str()).unwrap_or_default();
            if let Some(event) = parse_row(row) {
                out.push(event);
            }
        }
        out.sort_by_key(|e| std::cmp::Reverse(e.occurred_at_ms));
        out.truncate(MAX_EVENTS);

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_parse_ms").record(ms);
        counter!("ingest_events_total").increment(out.len() as u64);
        Ok(out)
    }
}

/// Expected cell order: date, latitude, longitude, depth, magnitude type,
/// magnitude, location. Anything that does not match is dropped.
fn parse_row(row: &str) -> Option<Event> {
    let cells: Vec<String> = re_cell()
        .captures_iter(row)
        .map(|c| {
            let raw = c.get(1).map(|m| m.as_str()).unwrap_or_default();
            let stripped = re_tags().replace_all(raw, "");
            html_escape::decode_html_entities(stripped.as_ref())
                .replace('\u{a0}', " ")
                .trim()
                .to_string()
        })
        .collect();
    if cells.len() < 7 {
        return None;
    }

    let date_str = &cells[0];
    if !re_date_shape().is_match(date_str) {
        return None;
    }
    let occurred_at_ms = parse_istanbul_civil_ms(date_str)?;

    let latitude: f64 = cells[1].parse().ok()?;
    let longitude: f64 = cells[2].parse().ok()?;
    let depth: f64 = cells[3].parse().ok()?;
    let magnitude: f64 = cells[5].parse().ok()?;

    if !(-90.0..=90.0).contains(&latitude)
        || !(-180.0..=180.0).contains(&longitude)
        || !(0.0..=1000.0).contains(&depth)
        || !(0.0..=10.0).contains(&magnitude)
    {
        return None;
    }

    let location = cells[6].trim().to_string();
    if location.is_empty() {
        return None;
    }

    Some(Event {
        id: Event::grid_id("afad-html", occurred_at_ms, latitude, longitude),
        magnitude,
        depth_km: depth,
        latitude,
        longitude,
        occurred_at_ms,
        location,
        source: SourceId::Afad,
    })
}

#[async_trait]
impl SourceProvider for AfadHtmlProvider {
    async fn fetch_recent(&self) -> Result<Vec<Event>> {
        match &self.mode {
            Mode::Fixture(s) => Self::parse_events_from_html(s),
            Mode::Http { client, resilience } => {
                let resp = resilience
                    .execute(ENDPOINT_KEY, &format!("GET {PAGE_URL}"), || {
                        let client = client.clone();
                        async move {
                            let r = client
                                .get(PAGE_URL)
                                .header("Accept", "text/html,application/xhtml+xml")
                                .header("Cache-Control", "no-cache, no-store, must-revalidate")
                                .send()
                                .await?;
                            let status = r.status().as_u16();
                            let body = r.text().await?;
                            Ok(HttpResponse { status, body })
                        }
                    })
                    .await?;
                if resp.body.len() < 100 {
                    return Err(anyhow!("afad page response too short"));
                }
                Self::parse_events_from_html(&resp.body)
            }
        }
    }

    fn name(&self) -> &'static str {
        "AFAD-HTML"
    }
}
