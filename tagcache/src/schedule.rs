//! Ordered index from expiry time to key.

use crate::error::CacheResult;
use crate::keys::KeySpace;
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Rank of a timestamp in the schedule: whole seconds since the Unix epoch,
/// rounded down.
pub fn rank(time: DateTime<Utc>) -> i64 {
    time.timestamp()
}

/// Start of the second a rank stands for.
pub fn rank_to_time(rank: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(rank, 0)
}

/// Sorted-set schedule of keys that were written with an expiry.
///
/// The schedule only hints at what a sweep should reclaim; native Store TTLs
/// stay authoritative.
#[derive(Clone)]
pub struct ExpirySchedule {
    store: Arc<dyn Store>,
    set_key: String,
}

impl ExpirySchedule {
    /// Create a schedule stored under the key space's schedule key.
    pub fn new(store: Arc<dyn Store>, keys: &KeySpace) -> Self {
        Self {
            store,
            set_key: keys.expiry_schedule(),
        }
    }

    /// Store key of the schedule.
    pub fn set_key(&self) -> &str {
        &self.set_key
    }

    /// Schedule (or reschedule) `key` to expire at `expiry`.
    pub async fn set_key_expiry(&self, key: &str, expiry: DateTime<Utc>) -> CacheResult<()> {
        self.store
            .sorted_set_add(&self.set_key, key, rank(expiry))
            .await
    }

    /// Unschedule `keys`. Keys that are not scheduled are ignored.
    pub async fn remove_key_expiry(&self, keys: &[String]) -> CacheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.store.sorted_set_remove(&self.set_key, keys).await
    }

    /// Keys scheduled at or before `max`, earliest first.
    pub async fn get_expired_keys(&self, max: DateTime<Utc>) -> CacheResult<Vec<String>> {
        self.store
            .sorted_set_range_by_score(&self.set_key, rank(max))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryStore;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    fn schedule() -> ExpirySchedule {
        ExpirySchedule::new(Arc::new(InMemoryStore::new()), &KeySpace::new("test"))
    }

    #[tokio::test]
    async fn test_expired_keys_are_ordered_and_bounded() {
        let schedule = schedule();
        let now = Utc::now();
        let ago = |minutes| now - ChronoDuration::minutes(minutes);

        schedule.set_key_expiry("minus10", ago(10)).await.unwrap();
        schedule.set_key_expiry("minus30", ago(30)).await.unwrap();
        schedule.set_key_expiry("minus20", ago(20)).await.unwrap();
        schedule.set_key_expiry("future", now + ChronoDuration::minutes(5)).await.unwrap();

        let keys = schedule.get_expired_keys(ago(20)).await.unwrap();
        assert_eq!(keys, vec!["minus30".to_string(), "minus20".to_string()]);
    }

    #[tokio::test]
    async fn test_reschedule_moves_key() {
        let schedule = schedule();
        let now = Utc::now();

        schedule.set_key_expiry("k", now - ChronoDuration::hours(1)).await.unwrap();
        schedule.set_key_expiry("k", now + ChronoDuration::hours(1)).await.unwrap();
        assert!(schedule.get_expired_keys(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_a_no_op_for_unknown_keys() {
        let schedule = schedule();
        let now = Utc::now();
        schedule.set_key_expiry("k", now).await.unwrap();

        schedule
            .remove_key_expiry(&["k".to_string(), "unknown".to_string()])
            .await
            .unwrap();
        schedule.remove_key_expiry(&[]).await.unwrap();
        assert!(schedule.get_expired_keys(now).await.unwrap().is_empty());
    }

    #[test]
    fn test_rank_floors_to_seconds() {
        let t = DateTime::from_timestamp(1_700_000_000, 999_000_000).unwrap();
        assert_eq!(rank(t), 1_700_000_000);
        assert_eq!(rank_to_time(rank(t)), DateTime::from_timestamp(1_700_000_000, 0));
    }

    proptest! {
        #[test]
        fn prop_rank_is_monotonic(
            a in -10_000_000_000i64..10_000_000_000,
            b in -10_000_000_000i64..10_000_000_000,
            na in 0u32..1_000_000_000,
            nb in 0u32..1_000_000_000,
        ) {
            let t1 = DateTime::from_timestamp(a, na).unwrap();
            let t2 = DateTime::from_timestamp(b, nb).unwrap();
            prop_assert_eq!(rank(t1) < rank(t2), a < b);
            prop_assert_eq!(rank_to_time(rank(t1)).map(rank), Some(a));
        }
    }
}
