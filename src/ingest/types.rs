// src/ingest/types.rs
use std::collections::BTreeSet;
use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Known upstream observatories. `Afad` is the institutionally trusted
/// primary authority unless the trust policy designates otherwise.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceId {
    Afad,
    Kandilli,
}

impl SourceId {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceId::Afad => "AFAD",
            SourceId::Kandilli => "KANDILLI",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical seismic event. Immutable once constructed; fusion builds new
/// aggregates instead of mutating published records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique per (source, occurrence): provider-native id or a
    /// source-prefixed composite of timestamp + rounded coordinates.
    pub id: String,
    pub magnitude: f64,
    pub depth_km: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// UTC epoch milliseconds. Providers convert from the producer's fixed
    /// civil-time offset before constructing an `Event`.
    pub occurred_at_ms: i64,
    pub location: String,
    pub source: SourceId,
}

impl Event {
    /// Composite id for providers without a native identifier, matching the
    /// upstream convention of timestamp + coordinates at 3 decimals.
    pub fn grid_id(prefix: &str, occurred_at_ms: i64, latitude: f64, longitude: f64) -> String {
        format!(
            "{prefix}-{occurred_at_ms}-{}-{}",
            (latitude * 1000.0).round() as i64,
            (longitude * 1000.0).round() as i64
        )
    }
}

/// A canonical event plus the corroboration metadata attached during fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedEvent {
    #[serde(flatten)]
    pub event: Event,
    pub corroborating_sources: BTreeSet<SourceId>,
    /// 0..=100; never decreases as corroborating sources are added.
    pub confidence: u8,
}

impl FusedEvent {
    pub fn single(event: Event, confidence: u8) -> Self {
        let mut corroborating_sources = BTreeSet::new();
        corroborating_sources.insert(event.source);
        Self {
            event,
            corroborating_sources,
            confidence,
        }
    }
}

/// One upstream adapter. Implementations own their transport and parsing and
/// convert provider-specific units into canonical `Event`s. Errors returned
/// here are converted to empty fetches (plus a diagnostic) by the fan-out in
/// `ingest::fetch_all`; nothing propagates past that boundary.
#[async_trait::async_trait]
pub trait SourceProvider: Send + Sync {
    async fn fetch_recent(&self) -> Result<Vec<Event>>;
    fn name(&self) -> &'static str;
}
