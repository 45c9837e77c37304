// src/validate/mod.rs
//! Plausibility scoring for fused events. Hard checks reject outright for
//! any source; soft checks lower a running confidence score that must clear
//! the source's accept floor. The primary authority tolerates a materially
//! higher penalty budget than secondary sources: its soft penalties are
//! halved and its floor is lower, so officially confirmed events are not
//! suppressed by heuristics.

pub mod advisor;

use std::collections::BTreeMap;

use metrics::counter;

use crate::config::TrustPolicy;
use crate::error::RejectReason;
use crate::fusion::haversine_km;
use crate::ingest::types::{Event, FusedEvent, SourceId};
use self::advisor::DynAdvisor;

// Exact-duplicate tolerances against the published set.
const DUP_TIME_MS: i64 = 60_000;
const DUP_DISTANCE_KM: f64 = 5.0;
const DUP_MAGNITUDE: f64 = 0.2;

// Cross-source comparison window.
const XSOURCE_TIME_MS: i64 = 2 * 60_000;
const XSOURCE_DISTANCE_KM: f64 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept { confidence: u8 },
    Reject { reason: RejectReason },
}

pub struct ValidationContext<'a> {
    /// The currently-published set: duplicate target and statistical window.
    pub published: &'a [FusedEvent],
    /// Per-source raw lists from this cycle, for cross-source agreement.
    pub per_source: &'a BTreeMap<SourceId, Vec<Event>>,
    pub now_ms: i64,
}

pub struct Validator {
    policy: TrustPolicy,
    advisor: DynAdvisor,
}

impl Validator {
    pub fn new(policy: TrustPolicy, advisor: DynAdvisor) -> Self {
        Self { policy, advisor }
    }

    pub async fn validate(&self, fused: &FusedEvent, ctx: &ValidationContext<'_>) -> Verdict {
        let event = &fused.event;
        let primary = self.policy.is_primary(event.source);

        // Hard checks: violation rejects regardless of source trust.
        if let Err(reason) = self.hard_checks(event, ctx.now_ms) {
            if primary {
                tracing::warn!(event = %event.id, %reason, "hard check failed on trusted source");
            } else {
                tracing::debug!(event = %event.id, %reason, "hard check failed");
            }
            return Verdict::Reject { reason };
        }

        let mut score = fused.confidence as i32;
        let mut anomalies: Vec<RejectReason> = Vec::new();
        let penalize = |score: &mut i32, anomalies: &mut Vec<RejectReason>, reason, penalty: i32| {
            let penalty = if primary { penalty / 2 } else { penalty };
            *score -= penalty;
            anomalies.push(reason);
        };

        if self.disagrees_with_other_sources(event, ctx) {
            penalize(
                &mut score,
                &mut anomalies,
                RejectReason::CrossSourceDisagreement,
                self.policy.magnitude_disagreement_penalty,
            );
        }

        if self.duplicates_published(event, ctx.published) {
            penalize(
                &mut score,
                &mut anomalies,
                RejectReason::DuplicateOfPublished,
                self.policy.duplicate_penalty,
            );
        }

        let (outlier, burst) = self.statistical_flags(event, ctx.published);
        if outlier {
            penalize(
                &mut score,
                &mut anomalies,
                RejectReason::StatisticalOutlier,
                self.policy.outlier_penalty,
            );
        }
        if burst {
            penalize(
                &mut score,
                &mut anomalies,
                RejectReason::StatisticalOutlier,
                self.policy.burst_penalty,
            );
        }

        // Advisory assessment: cost-bounded to higher magnitudes, soft only.
        if event.magnitude >= self.policy.advisor_min_magnitude {
            let flagged = self.advisor.assess(event, ctx.published).await;
            if !flagged.is_empty() {
                tracing::debug!(
                    event = %event.id,
                    advisor = self.advisor.name(),
                    anomalies = ?flagged,
                    "advisory flagged event"
                );
                penalize(
                    &mut score,
                    &mut anomalies,
                    RejectReason::AdvisoryAnomaly,
                    self.policy.advisor_penalty,
                );
            }
        }

        let floor = self.policy.accept_floor(event.source);
        let accepted = score >= floor
            && (primary || !self.policy.secondary_rejects_on_anomaly || anomalies.is_empty());

        if accepted {
            Verdict::Accept {
                confidence: score.clamp(0, 100) as u8,
            }
        } else {
            let reason = anomalies
                .into_iter()
                .next()
                .unwrap_or(RejectReason::LowConfidence);
            Verdict::Reject { reason }
        }
    }

    /// Batch entry point with bounded fan-out: chunks of 10 validated
    /// concurrently, partitioned into accepted/rejected.
    pub async fn validate_batch(
        &self,
        events: Vec<FusedEvent>,
        ctx: &ValidationContext<'_>,
    ) -> (Vec<FusedEvent>, Vec<(FusedEvent, RejectReason)>) {
        let mut accepted = Vec::with_capacity(events.len());
        let mut rejected = Vec::new();

        for chunk in events.chunks(10) {
            let verdicts =
                futures::future::join_all(chunk.iter().map(|f| self.validate(f, ctx))).await;
            for (fused, verdict) in chunk.iter().zip(verdicts) {
                match verdict {
                    Verdict::Accept { confidence } => {
                        let mut out = fused.clone();
                        out.confidence = confidence;
                        accepted.push(out);
                    }
                    Verdict::Reject { reason } => {
                        tracing::debug!(event = %fused.event.id, %reason, "validator rejected event");
                        rejected.push((fused.clone(), reason));
                    }
                }
            }
        }

        counter!("validator_accepted_total").increment(accepted.len() as u64);
        counter!("validator_rejected_total").increment(rejected.len() as u64);
        (accepted, rejected)
    }

    fn hard_checks(&self, event: &Event, now_ms: i64) -> Result<(), RejectReason> {
        if !event.magnitude.is_finite() || !(0.0..=10.0).contains(&event.magnitude) {
            return Err(RejectReason::MagnitudeOutOfRange);
        }
        if !(-90.0..=90.0).contains(&event.latitude)
            || !(-180.0..=180.0).contains(&event.longitude)
        {
            return Err(RejectReason::CoordinatesOutOfRange);
        }
        let delta_ms = event.occurred_at_ms - now_ms;
        if delta_ms > (self.policy.max_future_secs as i64) * 1_000 {
            return Err(RejectReason::TimestampInFuture);
        }
        if -delta_ms > (self.policy.max_past_secs(event.source) as i64) * 1_000 {
            return Err(RejectReason::TimestampTooOld);
        }
        Ok(())
    }

    /// A similar event reported by another source with a magnitude outside
    /// tolerance counts as disagreement; an absent counterpart does not.
    fn disagrees_with_other_sources(&self, event: &Event, ctx: &ValidationContext<'_>) -> bool {
        for (source, events) in ctx.per_source {
            if *source == event.source {
                continue;
            }
            let similar = events.iter().find(|other| {
                (other.occurred_at_ms - event.occurred_at_ms).abs() <= XSOURCE_TIME_MS
                    && haversine_km(
                        other.latitude,
                        other.longitude,
                        event.latitude,
                        event.longitude,
                    ) <= XSOURCE_DISTANCE_KM
            });
            if let Some(other) = similar {
                if (other.magnitude - event.magnitude).abs() > self.policy.fuse_magnitude_tolerance
                {
                    return true;
                }
            }
        }
        false
    }

    /// Same time/location/magnitude within tight tolerances but a different
    /// id: a re-report of something already published.
    fn duplicates_published(&self, event: &Event, published: &[FusedEvent]) -> bool {
        published.iter().any(|p| {
            p.event.id != event.id
                && (p.event.occurred_at_ms - event.occurred_at_ms).abs() < DUP_TIME_MS
                && (p.event.magnitude - event.magnitude).abs() < DUP_MAGNITUDE
                && haversine_km(
                    p.event.latitude,
                    p.event.longitude,
                    event.latitude,
                    event.longitude,
                ) < DUP_DISTANCE_KM
        })
    }

    /// Trailing-window statistics over the published set: a magnitude far
    /// above the 24h mean, or an abnormal report rate in the last hour.
    fn statistical_flags(&self, event: &Event, published: &[FusedEvent]) -> (bool, bool) {
        let day_ago = event.occurred_at_ms - 24 * 3_600 * 1_000;
        let trailing: Vec<&FusedEvent> = published
            .iter()
            .filter(|p| p.event.occurred_at_ms > day_ago && p.event.occurred_at_ms < event.occurred_at_ms)
            .collect();
        if trailing.is_empty() {
            return (false, false);
        }

        let mean: f64 = trailing.iter().map(|p| p.event.magnitude).sum::<f64>()
            / trailing.len() as f64;
        // Rare large events are real; widen the band once the report itself
        // is already strong.
        let band = if event.magnitude >= 4.5 { 3.0 } else { 2.0 };
        let outlier = event.magnitude > mean + band;

        let hour_ago = event.occurred_at_ms - 3_600 * 1_000;
        let last_hour = trailing
            .iter()
            .filter(|p| p.event.occurred_at_ms > hour_ago)
            .count();
        let burst = last_hour > self.policy.burst_reports_per_hour;

        (outlier, burst)
    }
}
