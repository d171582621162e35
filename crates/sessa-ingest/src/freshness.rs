//! Freshness gate in front of every read.
//!
//! Before a read is served, the age of the last successful ingestion is
//! compared with `max_age`; stale data triggers a blocking incremental
//! ingest. A failed refresh is reported, never swallowed.

use std::path::PathBuf;

use serde::Serialize;
use sessa_core::ts::age_secs;
use sessa_store::{Store, StoreError};
use time::OffsetDateTime;

use crate::error::IngestError;
use crate::pipeline::{ingest, IngestOptions, IngestScope, IngestionReport};

pub const DEFAULT_MAX_AGE_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Freshness {
    Fresh { age_secs: u64 },
    Refreshed(IngestionReport),
}

#[derive(Debug, thiserror::Error)]
pub enum FreshnessError {
    #[error(
        "data may be stale (last ingest {}, age {}): {source}",
        .last_ingest_at.as_deref().unwrap_or("never"),
        .age_secs.map(|s| format!("{s}s")).unwrap_or_else(|| "unknown".into())
    )]
    StaleDataUnavailable {
        last_ingest_at: Option<String>,
        age_secs: Option<u64>,
        #[source]
        source: IngestError,
    },
}

/// A read result plus the refresh failure it was served despite, if any.
#[derive(Debug)]
pub struct Served<T> {
    pub value: T,
    pub stale: Option<FreshnessError>,
}

#[derive(Debug, Clone)]
pub struct FreshnessGate {
    log_dir: PathBuf,
    max_age_secs: u64,
    batch_size: usize,
}

impl FreshnessGate {
    pub fn new(log_dir: impl Into<PathBuf>, max_age_secs: u64, batch_size: usize) -> Self {
        Self {
            log_dir: log_dir.into(),
            max_age_secs,
            batch_size,
        }
    }

    pub fn ensure_fresh(&self, store: &mut Store) -> Result<Freshness, FreshnessError> {
        self.ensure_fresh_at(store, OffsetDateTime::now_utc())
    }

    pub fn ensure_fresh_at(
        &self,
        store: &mut Store,
        now: OffsetDateTime,
    ) -> Result<Freshness, FreshnessError> {
        let last = store
            .last_ingest_at()
            .map_err(|e| self.stale(None, None, e.into()))?;
        let age = last.as_deref().and_then(|ts| age_secs(ts, now));

        if let Some(age) = age {
            if age <= self.max_age_secs {
                return Ok(Freshness::Fresh { age_secs: age });
            }
        }

        let scope = match &last {
            Some(ts) => IngestScope::Since(ts.clone()),
            None => IngestScope::All,
        };
        tracing::debug!(?age, max_age = self.max_age_secs, "data stale, refreshing");
        let opts = IngestOptions {
            scope,
            force: false,
            batch_size: self.batch_size,
        };
        match ingest(store, &self.log_dir, &opts) {
            Ok(report) => Ok(Freshness::Refreshed(report)),
            Err(e) => {
                tracing::warn!(error = %e, "freshness refresh failed");
                Err(self.stale(last, age, e))
            }
        }
    }

    /// Refresh if needed, then run `read`. A refresh failure does not block
    /// the read; it comes back in [`Served::stale`] for the caller to judge.
    pub fn read<T>(
        &self,
        store: &mut Store,
        read: impl FnOnce(&mut Store) -> Result<T, StoreError>,
    ) -> Result<Served<T>, StoreError> {
        let stale = self.ensure_fresh(store).err();
        let value = read(store)?;
        Ok(Served { value, stale })
    }

    fn stale(
        &self,
        last_ingest_at: Option<String>,
        age_secs: Option<u64>,
        source: IngestError,
    ) -> FreshnessError {
        FreshnessError::StaleDataUnavailable {
            last_ingest_at,
            age_secs,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessa_core::ts::parse_ts;

    fn setup() -> (tempfile::TempDir, PathBuf, Store) {
        let tmp = tempfile::tempdir().unwrap();
        let logs = tmp.path().join("logs");
        std::fs::create_dir_all(logs.join("-proj")).unwrap();
        std::fs::write(
            logs.join("-proj").join("s1.jsonl"),
            "{\"uuid\":\"a\",\"type\":\"user\",\"timestamp\":\"2025-01-01T00:00:00Z\"}\n",
        )
        .unwrap();
        let store = Store::open(&tmp.path().join("sessa.db")).unwrap();
        (tmp, logs, store)
    }

    #[test]
    fn never_ingested_triggers_refresh() {
        let (_tmp, logs, mut store) = setup();
        let gate = FreshnessGate::new(&logs, 300, 100);
        match gate.ensure_fresh(&mut store).unwrap() {
            Freshness::Refreshed(r) => assert_eq!(r.new_raw_entries, 1),
            other => panic!("expected refresh, got {other:?}"),
        }
        assert!(matches!(
            gate.ensure_fresh(&mut store).unwrap(),
            Freshness::Fresh { .. }
        ));
    }

    #[test]
    fn old_watermark_triggers_refresh() {
        let (_tmp, logs, mut store) = setup();
        let gate = FreshnessGate::new(&logs, 300, 100);
        store
            .set_meta("last_ingest_at", "2025-01-01T00:00:00.000Z")
            .unwrap();
        let within = parse_ts("2025-01-01T00:04:00Z").unwrap();
        assert_eq!(
            gate.ensure_fresh_at(&mut store, within).unwrap(),
            Freshness::Fresh { age_secs: 240 }
        );
        let beyond = parse_ts("2025-01-01T00:05:01Z").unwrap();
        assert!(matches!(
            gate.ensure_fresh_at(&mut store, beyond).unwrap(),
            Freshness::Refreshed(_)
        ));
    }

    #[test]
    fn unreadable_source_surfaces_staleness() {
        let (tmp, _logs, mut store) = setup();
        let gate = FreshnessGate::new(tmp.path().join("gone"), 300, 100);
        let err = gate.ensure_fresh(&mut store).unwrap_err();
        let FreshnessError::StaleDataUnavailable {
            last_ingest_at,
            source,
            ..
        } = err;
        assert!(last_ingest_at.is_none());
        assert!(matches!(source, IngestError::LogSourceUnavailable { .. }));
    }

    #[test]
    fn read_serves_despite_failed_refresh() {
        let (tmp, _logs, mut store) = setup();
        let gate = FreshnessGate::new(tmp.path().join("gone"), 300, 100);
        let served = gate.read(&mut store, |s| s.sessions(10)).unwrap();
        assert!(served.value.is_empty());
        assert!(served.stale.is_some());
    }
}
