// src/ingest/providers/mod.rs
pub mod afad_api;
pub mod afad_html;
pub mod aggregator;
pub mod kandilli_html;

use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Both observatories publish civil time for Europe/Istanbul at a fixed
/// +03:00 offset, usually without marking it. Timestamps that do carry an
/// offset (or a trailing `Z`) are honored as-is.
pub(crate) fn parse_istanbul_civil_ms(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(odt) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Some((odt.unix_timestamp_nanos() / 1_000_000) as i64);
    }

    let normalized = trimmed.replace('T', " ");
    // Drop fractional seconds if present.
    let normalized = normalized
        .split_once('.')
        .map(|(head, _)| head.to_string())
        .unwrap_or(normalized);

    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let dt = PrimitiveDateTime::parse(&normalized, &format).ok()?;
    let offset = UtcOffset::from_hms(3, 0, 0).ok()?;
    let odt = dt.assume_offset(offset);
    Some((odt.unix_timestamp_nanos() / 1_000_000) as i64)
}

/// Upstream JSON is inconsistent about numeric fields: the same field may be
/// a number or a quoted string depending on the record. Coalesce both.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum NumOrStr {
    Num(f64),
    Str(String),
}

impl NumOrStr {
    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            NumOrStr::Num(n) => Some(*n),
            NumOrStr::Str(s) => s.trim().parse::<f64>().ok(),
        }
    }

    pub(crate) fn as_string(&self) -> String {
        match self {
            NumOrStr::Num(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            NumOrStr::Str(s) => s.trim().to_string(),
        }
    }
}

/// Fallback label when a record carries coordinates but no usable place name.
pub(crate) const REGION_FALLBACK_LABEL: &str = "Türkiye";
