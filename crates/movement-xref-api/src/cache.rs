//! Read-through TTL cache in front of a [`MovementSource`].
//!
//! Only successful reads are stored, so a transient data-access failure is
//! retried on the next call.

use std::time::Duration;

use moka::sync::Cache;
use movement_xref_core::{CrossReferenceQuery, MovementRecord, MovementSource, XrefError};

use crate::SharedSource;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_CACHE_ENTRIES: u64 = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub max_entries: u64,
}

impl CacheSettings {
    #[must_use]
    pub fn disabled() -> Self {
        Self { ttl: Duration::ZERO, max_entries: 0 }
    }

    #[must_use]
    pub fn from_ttl_secs(ttl_secs: u64) -> Self {
        Self { ttl: Duration::from_secs(ttl_secs), max_entries: DEFAULT_CACHE_ENTRIES }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero() && self.max_entries > 0
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { ttl: DEFAULT_CACHE_TTL, max_entries: DEFAULT_CACHE_ENTRIES }
    }
}

pub struct CachedSource {
    inner: SharedSource,
    units: Cache<(), Vec<String>>,
    by_unit: Cache<String, Vec<MovementRecord>>,
    by_query: Cache<CrossReferenceQuery, Vec<MovementRecord>>,
}

impl CachedSource {
    #[must_use]
    pub fn new(inner: SharedSource, settings: CacheSettings) -> Self {
        Self {
            inner,
            units: Cache::builder().max_capacity(1).time_to_live(settings.ttl).build(),
            by_unit: Cache::builder()
                .max_capacity(settings.max_entries)
                .time_to_live(settings.ttl)
                .build(),
            by_query: Cache::builder()
                .max_capacity(settings.max_entries)
                .time_to_live(settings.ttl)
                .build(),
        }
    }

    pub fn invalidate_all(&self) {
        self.units.invalidate_all();
        self.by_unit.invalidate_all();
        self.by_query.invalidate_all();
    }
}

impl MovementSource for CachedSource {
    fn list_units(&self) -> Result<Vec<String>, XrefError> {
        if let Some(units) = self.units.get(&()) {
            tracing::debug!(units = units.len(), "unit list served from cache");
            return Ok(units);
        }
        let units = self.inner.list_units()?;
        self.units.insert((), units.clone());
        Ok(units)
    }

    fn query_by_unit(&self, unit: &str) -> Result<Vec<MovementRecord>, XrefError> {
        if let Some(records) = self.by_unit.get(unit) {
            tracing::debug!(unit, rows = records.len(), "primary lookup served from cache");
            return Ok(records);
        }
        let records = self.inner.query_by_unit(unit)?;
        self.by_unit.insert(unit.to_string(), records.clone());
        Ok(records)
    }

    fn query_by_members_and_periods(
        &self,
        query: &CrossReferenceQuery,
    ) -> Result<Vec<MovementRecord>, XrefError> {
        if let Some(records) = self.by_query.get(query) {
            tracing::debug!(
                unit = %query.exclude_unit,
                rows = records.len(),
                "cross-reference lookup served from cache"
            );
            return Ok(records);
        }
        let records = self.inner.query_by_members_and_periods(query)?;
        self.by_query.insert(query.clone(), records.clone());
        Ok(records)
    }

    fn has_year_column(&self) -> bool {
        self.inner.has_year_column()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use movement_xref_core::InMemorySource;

    use super::*;

    #[derive(Default)]
    struct CountingSource {
        inner: InMemorySource,
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl CountingSource {
        fn check(&self) -> Result<(), XrefError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(XrefError::DataAccess("timeout".to_string()));
            }
            Ok(())
        }
    }

    impl MovementSource for CountingSource {
        fn list_units(&self) -> Result<Vec<String>, XrefError> {
            self.check()?;
            self.inner.list_units()
        }

        fn query_by_unit(&self, unit: &str) -> Result<Vec<MovementRecord>, XrefError> {
            self.check()?;
            self.inner.query_by_unit(unit)
        }

        fn query_by_members_and_periods(
            &self,
            query: &CrossReferenceQuery,
        ) -> Result<Vec<MovementRecord>, XrefError> {
            self.check()?;
            self.inner.query_by_members_and_periods(query)
        }
    }

    fn counting_source() -> Arc<CountingSource> {
        Arc::new(CountingSource {
            inner: InMemorySource::new(vec![MovementRecord {
                unit: Some("PJ 1".to_string()),
                period: Some("JANEIRO".to_string()),
                member: Some("Ana".to_string()),
                ..MovementRecord::default()
            }]),
            ..CountingSource::default()
        })
    }

    #[test]
    fn repeated_reads_hit_the_cache() -> Result<(), XrefError> {
        let counting = counting_source();
        let cached = CachedSource::new(counting.clone(), CacheSettings::default());

        assert_eq!(cached.list_units()?, vec!["PJ 1"]);
        assert_eq!(cached.list_units()?, vec!["PJ 1"]);
        assert_eq!(cached.query_by_unit("PJ 1")?.len(), 1);
        assert_eq!(cached.query_by_unit("PJ 1")?.len(), 1);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);

        cached.invalidate_all();
        assert_eq!(cached.list_units()?, vec!["PJ 1"]);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[test]
    fn failures_are_not_cached() -> Result<(), XrefError> {
        let counting = counting_source();
        let cached = CachedSource::new(counting.clone(), CacheSettings::default());

        counting.failing.store(true, Ordering::SeqCst);
        assert!(matches!(cached.query_by_unit("PJ 1"), Err(XrefError::DataAccess(_))));

        counting.failing.store(false, Ordering::SeqCst);
        assert_eq!(cached.query_by_unit("PJ 1")?.len(), 1);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn zero_ttl_disables_caching() {
        assert!(!CacheSettings::from_ttl_secs(0).is_enabled());
        assert!(!CacheSettings::disabled().is_enabled());
        assert!(CacheSettings::from_ttl_secs(30).is_enabled());
    }
}
