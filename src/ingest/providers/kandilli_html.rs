// src/ingest/providers/kandilli_html.rs
//! Kandilli observatory list pages (`lst0.asp`/`lst1.asp`): a fixed-width
//! text table inside a `<pre>` block, Istanbul civil time, magnitudes in
//! three columns (MD, ML, Mw) with `-.-` marking an absent value. Several
//! mirror URLs are tried in order; the first page that yields events wins.
//!
//! Row format:
//! `2025.11.10 22:54:37  39.2353   28.1785        8.5      -.-  1.7  -.-   SINDIRGI (BALIKESIR)`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::config::RegionBounds;
use crate::error::ParseError;
use crate::ingest::providers::{parse_istanbul_civil_ms, REGION_FALLBACK_LABEL};
use crate::ingest::types::{Event, SourceId, SourceProvider};
use crate::resilience::{HttpResponse, ResilienceClient};

pub const ENDPOINT_KEY: &str = "kandilli-html";
const PAGE_URLS: &[&str] = &[
    "https://www.koeri.boun.edu.tr/scripts/lst0.asp",
    "https://www.koeri.boun.edu.tr/scripts/lst1.asp",
    "http://www.koeri.boun.edu.tr/scripts/lst0.asp",
];
const MAX_EVENTS: usize = 100;

const SCRAPE_USER_AGENT: &str =
    "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/605.1.15";

fn re_pre() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)<pre[^>]*>(.*?)</pre>").unwrap())
}

fn re_datetime() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4}\.\d{2}\.\d{2})\s+(\d{2}:\d{2}:\d{2})").unwrap())
}

fn re_coords() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s+(\d{2}\.\d{4})\s+(\d{2}\.\d{4})\s+(\d+\.?\d*)\s+").unwrap())
}

fn re_magnitudes() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    // Anchored: applied to the slice after the coordinate columns, otherwise
    // the numeric lat/lon/depth fields would satisfy the magnitude shapes.
    RE.get_or_init(|| {
        Regex::new(r"^(-\.-|\d+\.\d+)\s+(-\.-|\d+\.\d+)\s+(-\.-|\d+\.\d+)\s+(.+)$").unwrap()
    })
}

fn re_revision_marker() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    // Trailing solution-quality markers ("İlksel" = preliminary, or REVIZE banners).
    RE.get_or_init(|| Regex::new(r"\s+(İlksel|REVIZE.*)$").unwrap())
}

enum Mode {
    Fixture(String),
    Http {
        client: reqwest::Client,
        resilience: Arc<ResilienceClient>,
    },
}

pub struct KandilliHtmlProvider {
    mode: Mode,
    region: RegionBounds,
}

impl KandilliHtmlProvider {
    pub fn new(resilience: Arc<ResilienceClient>, region: RegionBounds) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(SCRAPE_USER_AGENT)
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client");
        Self {
            mode: Mode::Http { client, resilience },
            region,
        }
    }

    pub fn from_fixture_str(s: &str) -> Self {
        Self {
            mode: Mode::Fixture(s.to_string()),
            region: RegionBounds::default(),
        }
    }

    pub fn parse_events_from_html(&self, html: &str) -> Result<Vec<Event>> {
        let t0 = std::time::Instant::now();
        let pre = re_pre()
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| ParseError::new("kandilli list page", "no <pre> block found"))?;

        let mut out = Vec::new();
        for line in pre.lines() {
            let trimmed = line.trim();
            // Header, separator, and banner lines never start with a digit.
            if trimmed.len() < 50 || !trimmed.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            if let Some(event) = self.parse_line(trimmed) {
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

    fn parse_line(&self, line: &str) -> Option<Event> {
        let dt = re_datetime().captures(line)?;
        let date = dt.get(1)?.as_str().replace('.', "-");
        let time = dt.get(2)?.as_str();
        let occurred_at_ms = parse_istanbul_civil_ms(&format!("{date} {time}"))?;

        let coords = re_coords().captures(line)?;
        let latitude: f64 = coords.get(1)?.as_str().parse().ok()?;
        let longitude: f64 = coords.get(2)?.as_str().parse().ok()?;
        let depth_km: f64 = coords.get(3)?.as_str().parse().ok()?;

        let rest = &line[coords.get(0)?.end()..];
        let mags = re_magnitudes().captures(rest)?;
        let magnitude = pick_magnitude(
            mags.get(1)?.as_str(),
            mags.get(2)?.as_str(),
            mags.get(3)?.as_str(),
        )?;

        let raw_label = mags.get(4)?.as_str();
        let label = re_revision_marker().replace(raw_label, "");
        let mut location = label.split_whitespace().collect::<Vec<_>>().join(" ");
        if location.is_empty() {
            location = REGION_FALLBACK_LABEL.to_string();
        }

        if !(0.0..=1000.0).contains(&depth_km) || !(0.0..=10.0).contains(&magnitude) {
            return None;
        }
        // Regional observatory: reports outside its own box are noise.
        if !self.region.contains(latitude, longitude) {
            return None;
        }

        Some(Event {
            id: Event::grid_id("kandilli-html", occurred_at_ms, latitude, longitude),
            magnitude,
            depth_km,
            latitude,
            longitude,
            occurred_at_ms,
            location,
            source: SourceId::Kandilli,
        })
    }
}

/// Column priority ML > Mw > MD; `-.-` means the solution lacks that value.
fn pick_magnitude(md: &str, ml: &str, mw: &str) -> Option<f64> {
    for column in [ml, mw, md] {
        if column == "-.-" {
            continue;
        }
        if let Ok(v) = column.parse::<f64>() {
            if v > 0.0 {
                return Some(v);
            }
        }
    }
    None
}

#[async_trait]
impl SourceProvider for KandilliHtmlProvider {
    async fn fetch_recent(&self) -> Result<Vec<Event>> {
        match &self.mode {
            Mode::Fixture(s) => self.parse_events_from_html(s),
            Mode::Http { client, resilience } => {
                let mut last_err = anyhow!("no kandilli url attempted");
                for url in PAGE_URLS {
                    let fetched = resilience
                        .execute(ENDPOINT_KEY, &format!("GET {url}"), || {
                            let client = client.clone();
                            async move {
                                let r = client
                                    .get(*url)
                                    .header("Accept", "text/html,application/xhtml+xml")
                                    .header("Accept-Language", "tr-TR,tr;q=0.9")
                                    .header("Cache-Control", "no-cache")
                                    .send()
                                    .await?;
                                let status = r.status().as_u16();
                                let body = r.text().await?;
                                Ok(HttpResponse { status, body })
                            }
                        })
                        .await;
                    match fetched {
                        Ok(resp) if resp.body.len() >= 100 => {
                            match self.parse_events_from_html(&resp.body) {
                                Ok(events) if !events.is_empty() => return Ok(events),
                                Ok(_) => {
                                    last_err = anyhow!("kandilli page {url} parsed to zero events")
                                }
                                Err(e) => last_err = e,
                            }
                        }
                        Ok(_) => last_err = anyhow!("kandilli page {url} response too short"),
                        Err(e) => last_err = e.into(),
                    }
                    tracing::debug!(provider = "KANDILLI-HTML", url, "mirror failed, trying next");
                }
                Err(last_err)
            }
        }
    }

    fn name(&self) -> &'static str {
        "KANDILLI-HTML"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body><pre>
TÜRKİYE VE YAKIN ÇEVRESİNDEKİ SON DEPREMLER
----------  --------  --------  ----------      ------------    --------------
Tarih       Saat      Enlem(N)  Boylam(E)  Der(km)  MD   ML   Mw    Yer
----------  --------  --------  --------   ------- ------------    --------------
2025.11.10 22:54:37  39.2353   28.1785        8.5      -.-  1.7  -.-   SINDIRGI (BALIKESIR) İlksel
2025.11.10 22:41:02  40.7012   29.1034        6.2      -.-  5.5  5.4   KORFEZ (KOCAELI) İlksel
2025.11.10 22:30:00  52.1000   12.3456        9.0      -.-  3.1  -.-   OUTSIDE REGION
2025.11.10 22:15:10  38.4412   39.0821       11.0      -.-  -.-  -.-   ELAZIG
garbage line that should be ignored even though it is quite long indeed
</pre></body></html>"#;

    fn provider() -> KandilliHtmlProvider {
        KandilliHtmlProvider::from_fixture_str(PAGE)
    }

    #[test]
    fn parses_rows_and_skips_headers_and_garbage() {
        let events = provider().parse_events_from_html(PAGE).unwrap();
        // 4 data rows: one outside the box, one with no magnitude at all.
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].location, "SINDIRGI (BALIKESIR)");
        assert_eq!(events[0].magnitude, 1.7);
        assert_eq!(events[0].source, SourceId::Kandilli);
    }

    #[test]
    fn ml_column_preferred_then_mw() {
        assert_eq!(pick_magnitude("-.-", "1.7", "-.-"), Some(1.7));
        assert_eq!(pick_magnitude("2.0", "-.-", "5.4"), Some(5.4));
        assert_eq!(pick_magnitude("2.0", "-.-", "-.-"), Some(2.0));
        assert_eq!(pick_magnitude("-.-", "-.-", "-.-"), None);
    }

    #[test]
    fn revision_marker_is_stripped_from_labels() {
        let events = provider().parse_events_from_html(PAGE).unwrap();
        assert!(events.iter().all(|e| !e.location.contains("İlksel")));
    }

    #[test]
    fn civil_time_converts_to_utc() {
        let events = provider().parse_events_from_html(PAGE).unwrap();
        let ms = events[0].occurred_at_ms;
        let utc = time::OffsetDateTime::from_unix_timestamp(ms / 1000).unwrap();
        // 22:54:37 Istanbul == 19:54:37 UTC
        assert_eq!((utc.hour(), utc.minute(), utc.second()), (19, 54, 37));
    }

    #[test]
    fn page_without_pre_is_an_error() {
        assert!(provider()
            .parse_events_from_html("<html><body>down for maintenance</body></html>")
            .is_err());
    }
}
