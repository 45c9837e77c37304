// src/cache.rs
//! Offline cache: the last accepted event set plus its write timestamp,
//! persisted as a single JSON document under one well-known path, with a
//! companion last-fetch timestamp file. Overwritten wholesale each
//! successful cycle, never merged.
//!
//! Staleness is reported to the caller, not enforced by withholding data:
//! anything younger than the hard ceiling is served even when stale, because
//! an emergency-information consumer prefers stale data to no data. Entries
//! past the ceiling are purged. Corrupt entries purge and start fresh.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::ingest::types::FusedEvent;

const EVENTS_FILE: &str = "events.json";
const LAST_FETCH_FILE: &str = "last_fetch";

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    events: Vec<FusedEvent>,
    written_at_ms: i64,
}

pub struct CacheStore {
    dir: PathBuf,
    max_age_ms: i64,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>, max_age_hours: u64) -> Self {
        let dir = dir.into();
        let _ = fs::create_dir_all(&dir); // best-effort
        Self {
            dir,
            max_age_ms: (max_age_hours as i64) * 3_600 * 1_000,
        }
    }

    fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    fn last_fetch_path(&self) -> PathBuf {
        self.dir.join(LAST_FETCH_FILE)
    }

    /// Overwrite the entry and stamp the write time.
    pub fn save(&self, events: &[FusedEvent]) -> Result<(), CacheError> {
        self.save_at(events, chrono::Utc::now().timestamp_millis())
    }

    /// Write with an explicit timestamp; `save` delegates here.
    pub fn save_at(&self, events: &[FusedEvent], written_at_ms: i64) -> Result<(), CacheError> {
        let entry = CacheEntry {
            events: events.to_vec(),
            written_at_ms,
        };
        let json = serde_json::to_string(&entry)
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        write_atomic(&self.events_path(), json.as_bytes())?;
        write_atomic(&self.last_fetch_path(), written_at_ms.to_string().as_bytes())?;
        Ok(())
    }

    /// The stored events, or `None` on first run, past-ceiling entries
    /// (purged), or corruption (purged).
    pub fn load(&self) -> Option<Vec<FusedEvent>> {
        let raw = match fs::read_to_string(self.events_path()) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(error = %e, "cache read failed");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "cache entry corrupt, purging");
                self.purge();
                return None;
            }
        };

        let age_ms = chrono::Utc::now().timestamp_millis() - entry.written_at_ms;
        if age_ms > self.max_age_ms {
            tracing::info!(
                age_hours = age_ms / 3_600_000,
                "cache entry past staleness ceiling, purging"
            );
            self.purge();
            return None;
        }
        Some(entry.events)
    }

    /// Age of the entry in minutes, or `None` when nothing is cached.
    pub fn age_minutes(&self) -> Option<i64> {
        let raw = fs::read_to_string(self.last_fetch_path()).ok()?;
        let written_at_ms: i64 = raw.trim().parse().ok()?;
        let age_ms = chrono::Utc::now().timestamp_millis() - written_at_ms;
        Some(age_ms / 60_000)
    }

    pub fn purge(&self) {
        let _ = fs::remove_file(self.events_path());
        let _ = fs::remove_file(self.last_fetch_path());
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = path.with_extension("tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(bytes)?;
    fs::rename(tmp, path)?;
    Ok(())
}
