// src/alerts.rs
//! Advisory alert boundary. The orchestrator forwards newly-published
//! high-magnitude events here once per event id; formatting and delivery
//! (push, sound, haptics) belong to the consumer behind `AlertSink`.

use std::sync::Arc;

use crate::ingest::types::FusedEvent;

/// Payload forwarded for a newly-published high-magnitude event.
#[derive(Debug, Clone)]
pub struct EventAlert {
    pub event: FusedEvent,
    /// Rough epicentral shaking estimate (MMI 1-12) for consumer triage.
    pub estimated_intensity: u8,
}

#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &EventAlert);
    fn name(&self) -> &'static str;
}

/// Fans one alert out to every configured sink.
pub struct AlertMux {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl AlertMux {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    pub async fn notify(&self, alert: &EventAlert) {
        for sink in &self.sinks {
            sink.notify(alert).await;
        }
    }
}

/// Default sink: structured log only; real delivery lives downstream.
pub struct LogAlertSink;

#[async_trait::async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: &EventAlert) {
        let e = &alert.event.event;
        tracing::warn!(
            magnitude = e.magnitude,
            location = %e.location,
            intensity = alert.estimated_intensity,
            confidence = alert.event.confidence,
            sources = ?alert.event.corroborating_sources,
            "high-magnitude event published"
        );
    }
    fn name(&self) -> &'static str {
        "log"
    }
}

/// Empirical attenuation estimate of shaking intensity (MMI) at a given
/// epicentral distance.
pub fn estimate_intensity(magnitude: f64, distance_km: f64) -> u8 {
    let distance = distance_km.max(1.0);
    let intensity = magnitude * 1.5 - distance.log10() * 1.5;
    intensity.round().clamp(1.0, 12.0) as u8
}
