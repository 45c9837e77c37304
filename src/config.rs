// src/config.rs
//! Pipeline configuration. Loaded from TOML with an env-var path override
//! and built-in defaults; a missing file is never fatal.
//!
//! Resolution order:
//! 1) $QUAKE_PIPELINE_CONFIG
//! 2) config/pipeline.toml
//! 3) compiled-in defaults

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::ingest::types::SourceId;

pub const ENV_CONFIG_PATH: &str = "QUAKE_PIPELINE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seconds between fetch cycles.
    pub cycle_interval_secs: u64,
    /// Events at or above this magnitude are forwarded to the alert boundary.
    pub alert_magnitude_threshold: f64,
    /// Published set is capped to the most recent N events.
    pub published_cap: usize,
    pub bind_addr: String,
    pub cache: CacheConfig,
    pub resilience: ResilienceConfig,
    pub trust: TrustPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 60,
            alert_magnitude_threshold: 4.5,
            published_cap: 100,
            bind_addr: "0.0.0.0:8000".to_string(),
            cache: CacheConfig::default(),
            resilience: ResilienceConfig::default(),
            trust: TrustPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: String,
    /// Hard staleness ceiling; older entries are purged, not served.
    pub max_age_hours: u64,
    /// Above this age a cache fallback is surfaced as degraded operation.
    pub degraded_after_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: "cache".to_string(),
            max_age_hours: 24,
            degraded_after_hours: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    /// Identical in-flight requests within this window share one result.
    pub inflight_window_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            failure_threshold: 5,
            cooldown_ms: 60_000,
            inflight_window_ms: 2_000,
        }
    }
}

/// Geographic box applied to regional (secondary) providers. The primary
/// authority is exempt from the box but not from absolute range checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Default for RegionBounds {
    fn default() -> Self {
        // Anatolia box used by the regional observatories.
        Self {
            min_lat: 35.0,
            max_lat: 43.0,
            min_lon: 25.0,
            max_lon: 45.0,
        }
    }
}

impl RegionBounds {
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.min_lat
            && latitude <= self.max_lat
            && longitude >= self.min_lon
            && longitude <= self.max_lon
    }
}

/// Trust/tolerance asymmetry between the primary authority and secondary
/// sources. Thresholds here are tunable policy, not physical law.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustPolicy {
    pub primary_source: SourceId,

    // Normalizer time bounds.
    pub max_future_secs: u64,
    pub max_past_secs_primary: u64,
    pub max_past_secs_secondary: u64,

    // Fusion matching tolerances.
    pub fuse_time_delta_secs: u64,
    pub fuse_distance_km: f64,
    pub fuse_magnitude_tolerance: f64,

    // Confidence ladder.
    pub seed_confidence: u8,
    pub corroborated_confidence: u8,
    pub uncorroborated_confidence: u8,

    // Validator floors and penalties.
    pub accept_floor_primary: i32,
    pub accept_floor_secondary: i32,
    /// Secondary sources reject outright when any soft check flagged.
    pub secondary_rejects_on_anomaly: bool,
    pub magnitude_disagreement_penalty: i32,
    pub duplicate_penalty: i32,
    pub outlier_penalty: i32,
    pub burst_penalty: i32,
    pub advisor_penalty: i32,
    /// Advisory assessment is consulted only at or above this magnitude.
    pub advisor_min_magnitude: f64,
    /// Trailing-hour report count above which the burst penalty applies.
    pub burst_reports_per_hour: usize,

    pub region: RegionBounds,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            primary_source: SourceId::Afad,
            max_future_secs: 3_600,
            max_past_secs_primary: 30 * 24 * 3_600,
            max_past_secs_secondary: 7 * 24 * 3_600,
            fuse_time_delta_secs: 60,
            fuse_distance_km: 30.0,
            fuse_magnitude_tolerance: 0.5,
            seed_confidence: 80,
            corroborated_confidence: 95,
            uncorroborated_confidence: 70,
            accept_floor_primary: 50,
            accept_floor_secondary: 60,
            secondary_rejects_on_anomaly: true,
            magnitude_disagreement_penalty: 15,
            duplicate_penalty: 40,
            outlier_penalty: 10,
            burst_penalty: 5,
            advisor_penalty: 15,
            advisor_min_magnitude: 4.5,
            burst_reports_per_hour: 20,
            region: RegionBounds::default(),
        }
    }
}

impl TrustPolicy {
    pub fn is_primary(&self, source: SourceId) -> bool {
        source == self.primary_source
    }

    pub fn max_past_secs(&self, source: SourceId) -> u64 {
        if self.is_primary(source) {
            self.max_past_secs_primary
        } else {
            self.max_past_secs_secondary
        }
    }

    pub fn accept_floor(&self, source: SourceId) -> i32 {
        if self.is_primary(source) {
            self.accept_floor_primary
        } else {
            self.accept_floor_secondary
        }
    }
}

impl PipelineConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        let mut cfg: PipelineConfig = toml::from_str(&content).context("parsing pipeline toml")?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Env var path, then `config/pipeline.toml`, then defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        Ok(Self::default())
    }

    /// Clamp obviously invalid values back to defaults instead of failing.
    fn sanitize(&mut self) {
        if self.cycle_interval_secs == 0 {
            self.cycle_interval_secs = 60;
        }
        if self.published_cap == 0 {
            self.published_cap = 100;
        }
        let t = &mut self.trust;
        if !(0.0..=10.0).contains(&t.fuse_magnitude_tolerance) {
            t.fuse_magnitude_tolerance = 0.5;
        }
        if t.region.min_lat > t.region.max_lat {
            std::mem::swap(&mut t.region.min_lat, &mut t.region.max_lat);
        }
        if t.region.min_lon > t.region.max_lon {
            std::mem::swap(&mut t.region.min_lon, &mut t.region.max_lon);
        }
        if t.corroborated_confidence < t.seed_confidence {
            // corroboration must never lower confidence
            t.corroborated_confidence = t.seed_confidence;
        }
    }
}
