// src/dedup.rs
//! Same-source duplicate collapsing. Events are bucketed by a composite key
//! of 1-minute time bucket, coordinates rounded to 3 decimals (~0.1 km), and
//! magnitude rounded to 0.1. Within a bucket, duplicates from the *same*
//! source collapse to the first seen; reports from different sources sharing
//! a bucket are both retained so fusion can reason about cross-source
//! overlap explicitly.

use std::collections::HashSet;

use metrics::counter;

use crate::ingest::types::{Event, SourceId};

type BucketKey = (i64, i64, i64, i64, SourceId);

fn bucket_key(event: &Event) -> BucketKey {
    (
        event.occurred_at_ms.div_euclid(60_000),
        (event.latitude * 1000.0).round() as i64,
        (event.longitude * 1000.0).round() as i64,
        (event.magnitude * 10.0).round() as i64,
        event.source,
    )
}

/// Collapse same-source duplicates, preserving input order otherwise.
/// Returns the surviving events and the number removed.
pub fn dedupe(events: Vec<Event>) -> (Vec<Event>, usize) {
    let mut seen: HashSet<BucketKey> = HashSet::with_capacity(events.len());
    let mut kept = Vec::with_capacity(events.len());
    let mut removed = 0usize;

    for event in events {
        if seen.insert(bucket_key(&event)) {
            kept.push(event);
        } else {
            removed += 1;
        }
    }

    counter!("ingest_dedup_total").increment(removed as u64);
    (kept, removed)
}
