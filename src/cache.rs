//! TTL cache of assembled records, one partition per device.
//!
//! Entries are replaced on every successful refresh and survive expiry as
//! "last known good" for the stale fallback. They are dropped by an explicit
//! invalidation or when the local wall-clock hour changes, so that values
//! reset at midnight are never served from the previous day.

use crate::{device::DeviceId, records::UnifiedRecord, register::Category};
use chrono::{DateTime, Datelike, Local, Timelike};
use parking_lot::Mutex;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;

/// Time to live per category; zero disables caching for that category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheTtl {
    #[serde(with = "humantime_serde")]
    pub runtime: Duration,
    #[serde(with = "humantime_serde")]
    pub energy: Duration,
    #[serde(with = "humantime_serde")]
    pub battery: Duration,
    #[serde(with = "humantime_serde")]
    pub parameters: Duration,
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            runtime: Duration::from_secs(20),
            energy: Duration::from_secs(60),
            battery: Duration::from_secs(20),
            parameters: Duration::from_secs(3600),
        }
    }
}

impl CacheTtl {
    /// TTL of `category`.
    pub fn for_category(&self, category: Category) -> Duration {
        match category {
            Category::Runtime => self.runtime,
            Category::Energy => self.energy,
            Category::Battery => self.battery,
            Category::Parameters => self.parameters,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Arc<UnifiedRecord>,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    /// Whether the entry is younger than its TTL at `now`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }
}

/// Snapshot of the invalidation state of one `(device, category)` slot.
///
/// Taken before a fetch starts; a record fetched under an outdated
/// generation is not stored, so an invalidation that happened while the
/// fetch was in flight is never undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    epoch: u64,
    slot: u64,
}

#[derive(Debug, Default)]
struct Partitions {
    entries: HashMap<(DeviceId, Category), CacheEntry>,
    /// Bumped by every invalidation of a slot.
    generations: HashMap<(DeviceId, Category), u64>,
    /// Bumped by every hour rollover purge.
    epoch: u64,
    /// `(day, hour)` of the last rollover check.
    hour: Option<(u32, u32)>,
}

impl Partitions {
    fn generation(&self, key: (DeviceId, Category)) -> Generation {
        Generation {
            epoch: self.epoch,
            slot: self.generations.get(&key).copied().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Cache {
    ttl: CacheTtl,
    inner: Mutex<Partitions>,
}

impl Cache {
    pub fn new(ttl: CacheTtl) -> Self {
        Self {
            ttl,
            inner: Mutex::default(),
        }
    }

    /// Whether records of `category` are kept at all.
    pub fn is_cacheable(&self, category: Category) -> bool {
        !self.ttl.for_category(category).is_zero()
    }

    /// The entry for `(device, category)` if it is still within its TTL.
    pub fn fresh(&self, device: DeviceId, category: Category) -> Option<Arc<UnifiedRecord>> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(&(device, category))
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.value.clone())
    }

    /// The entry for `(device, category)` regardless of its age.
    pub fn last_known(&self, device: DeviceId, category: Category) -> Option<Arc<UnifiedRecord>> {
        self.inner
            .lock()
            .entries
            .get(&(device, category))
            .map(|entry| entry.value.clone())
    }

    /// Current generation of `(device, category)`, to be passed to
    /// [`Cache::store_if_current`] once the fetch completes.
    pub fn generation(&self, device: DeviceId, category: Category) -> Generation {
        self.inner.lock().generation((device, category))
    }

    /// Stores a freshly fetched record unless the slot was invalidated or
    /// purged since `generation` was taken. Non-cacheable categories are
    /// ignored. Returns whether the record was stored.
    pub fn store_if_current(
        &self,
        device: DeviceId,
        category: Category,
        generation: Generation,
        value: Arc<UnifiedRecord>,
    ) -> bool {
        if !self.is_cacheable(category) {
            return false;
        }
        let ttl = self.ttl.for_category(category);
        let key = (device, category);
        let mut inner = self.inner.lock();
        if inner.generation(key) != generation {
            log::debug!("{device}: {category} changed while fetching, record not cached");
            return false;
        }
        let entry = CacheEntry {
            value,
            fetched_at: Instant::now(),
            ttl,
        };
        inner.entries.insert(key, entry);
        true
    }

    /// Drops exactly one entry and outdates fetches in flight for it.
    /// Returns whether there was an entry.
    pub fn invalidate(&self, device: DeviceId, category: Category) -> bool {
        let key = (device, category);
        let mut inner = self.inner.lock();
        *inner.generations.entry(key).or_default() += 1;
        inner.entries.remove(&key).is_some()
    }

    /// Number of stored entries, fresh or not.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purges every entry when the wall-clock hour differs from the one seen
    /// on the previous call. Returns whether a purge happened.
    pub fn roll_hour(&self, now: DateTime<Local>) -> bool {
        let hour = (now.ordinal(), now.hour());
        let mut inner = self.inner.lock();
        match inner.hour.replace(hour) {
            Some(previous) if previous != hour => {
                let purged = inner.entries.len();
                inner.entries.clear();
                inner.epoch += 1;
                log::debug!("hour changed, purged {purged} cache entries");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ParameterRecord, UnifiedRecord};
    use chrono::{TimeZone, Utc};

    fn record() -> Arc<UnifiedRecord> {
        Arc::new(UnifiedRecord::Parameters(ParameterRecord {
            captured_at: Utc::now(),
            values: Default::default(),
        }))
    }

    fn store(cache: &Cache, device: DeviceId, category: Category) -> bool {
        let generation = cache.generation(device, category);
        cache.store_if_current(device, category, generation, record())
    }

    fn local(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_but_stay_known() {
        let cache = Cache::new(CacheTtl::default());
        let device = DeviceId(0);
        store(&cache, device, Category::Runtime);
        assert!(cache.fresh(device, Category::Runtime).is_some());

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(cache.fresh(device, Category::Runtime).is_none());
        assert!(cache.last_known(device, Category::Runtime).is_some());
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = Cache::new(CacheTtl {
            battery: Duration::ZERO,
            ..Default::default()
        });
        assert!(!cache.is_cacheable(Category::Battery));
        assert!(!store(&cache, DeviceId(0), Category::Battery));
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidation_is_scoped_to_one_device_and_category() {
        let cache = Cache::new(CacheTtl::default());
        let (d, other) = (DeviceId(0), DeviceId(1));
        for category in Category::ALL {
            store(&cache, d, category);
            store(&cache, other, category);
        }

        assert!(cache.invalidate(d, Category::Parameters));

        assert!(cache.last_known(d, Category::Parameters).is_none());
        for category in [Category::Runtime, Category::Energy, Category::Battery] {
            assert!(cache.last_known(d, category).is_some());
        }
        for category in Category::ALL {
            assert!(cache.last_known(other, category).is_some());
        }
        assert_eq!(cache.len(), 7);
    }

    #[test]
    fn hour_rollover_purges_everything() {
        let cache = Cache::new(CacheTtl::default());
        assert!(!cache.roll_hour(local(23, 10)));
        store(&cache, DeviceId(0), Category::Energy);

        assert!(!cache.roll_hour(local(23, 59)));
        assert_eq!(cache.len(), 1);

        assert!(cache.roll_hour(local(0, 0)));
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidation_outdates_fetches_in_flight() {
        let cache = Cache::new(CacheTtl::default());
        let device = DeviceId(0);
        let before = cache.generation(device, Category::Parameters);

        // no entry yet, the generation still moves
        assert!(!cache.invalidate(device, Category::Parameters));

        assert!(!cache.store_if_current(device, Category::Parameters, before, record()));
        assert!(cache.last_known(device, Category::Parameters).is_none());

        let other = cache.generation(device, Category::Runtime);
        assert!(cache.store_if_current(device, Category::Runtime, other, record()));
        assert!(store(&cache, device, Category::Parameters));
    }

    #[test]
    fn hour_rollover_outdates_fetches_in_flight() {
        let cache = Cache::new(CacheTtl::default());
        let device = DeviceId(3);
        cache.roll_hour(local(9, 59));
        let before = cache.generation(device, Category::Energy);

        assert!(cache.roll_hour(local(10, 0)));

        assert!(!cache.store_if_current(device, Category::Energy, before, record()));
        assert!(cache.is_empty());
    }
}
