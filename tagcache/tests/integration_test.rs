//! Integration tests for tagcache

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tagcache::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    name: String,
}

fn ada() -> User {
    User {
        name: "Ada".to_string(),
    }
}

struct Fixture {
    clock: ManualClock,
    store: Arc<InMemoryStore>,
    engine: Arc<CacheEngine>,
}

fn fixture_with(config: CacheConfiguration) -> Fixture {
    let clock = ManualClock::default();
    let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
    let engine = Arc::new(
        CacheEngine::new(store.clone(), &config).with_clock(Arc::new(clock.clone())),
    );
    Fixture {
        clock,
        store,
        engine,
    }
}

fn fixture() -> Fixture {
    fixture_with(CacheConfiguration::new().with_expiry_grace_period(Duration::ZERO))
}

#[tokio::test]
async fn test_round_trip_in_every_format() {
    for format in [
        SerializationFormat::Json,
        SerializationFormat::Binary,
        SerializationFormat::Xml,
    ] {
        let f = fixture_with(CacheConfiguration::new().with_serializer(format));
        let expiry = f.clock.now() + ChronoDuration::minutes(5);

        assert!(
            f.engine
                .set("User:1", Some(&ada()), Some(expiry), &["a", "b"])
                .await
                .unwrap()
        );
        assert_eq!(f.engine.get::<User>("User:1").await.unwrap(), Some(ada()), "{}", format);

        f.engine.set("User:2", Some(&ada()), None, &[]).await.unwrap();
        assert_eq!(f.engine.get::<User>("User:2").await.unwrap(), Some(ada()), "{}", format);
    }
}

#[tokio::test]
async fn test_empty_and_null_values_round_trip_as_xml() {
    let f = fixture_with(CacheConfiguration::new().with_serializer(SerializationFormat::Xml));

    f.engine
        .set("Vec:1", Some(&Vec::<u32>::new()), None, &["xml"])
        .await
        .unwrap();
    f.engine
        .set("Option:1", Some(&None::<u32>), None, &["xml"])
        .await
        .unwrap();

    assert_eq!(f.engine.get::<Vec<u32>>("Vec:1").await.unwrap(), Some(Vec::new()));
    assert_eq!(f.engine.get::<Option<u32>>("Option:1").await.unwrap(), Some(None));
}

#[tokio::test]
async fn test_past_expiry_is_absent_without_sweep() {
    let f = fixture();
    let expiry = f.clock.now() - ChronoDuration::seconds(10);

    f.engine
        .set("User:1", Some(&ada()), Some(expiry), &["t"])
        .await
        .unwrap();

    assert_eq!(f.engine.get::<User>("User:1").await.unwrap(), None);
    assert!(!f.engine.exists("User:1").await.unwrap());
    assert!(f.engine.keys_for_tag("t").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tag_fan_out_and_removal() {
    let f = fixture();
    for i in 0..5 {
        let user = User {
            name: format!("user-{}", i),
        };
        f.engine
            .set(&format!("User:{}", i), Some(&user), None, &["all"])
            .await
            .unwrap();
    }

    let names: HashSet<String> = f
        .engine
        .get_by_tag::<User>("all")
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.name)
        .collect();
    assert_eq!(names.len(), 5);

    f.engine.remove("User:3").await.unwrap();
    let names: HashSet<String> = f
        .engine
        .get_by_tag::<User>("all")
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.name)
        .collect();
    assert_eq!(names.len(), 4);
    assert!(!names.contains("user-3"));
}

#[tokio::test]
async fn test_tag_replacement_leaves_no_stale_membership() {
    let f = fixture();
    f.engine
        .set("User:1", Some(&ada()), None, &["old", "kept"])
        .await
        .unwrap();
    f.engine
        .set("User:1", Some(&ada()), None, &["kept", "new"])
        .await
        .unwrap();

    assert!(f.engine.keys_for_tag("old").await.unwrap().is_empty());
    assert!(f.engine.keys_for_tag("kept").await.unwrap().contains("User:1"));
    assert!(f.engine.keys_for_tag("new").await.unwrap().contains("User:1"));
    assert_eq!(
        f.engine.tags_for_key("User:1").await.unwrap(),
        HashSet::from(["kept".to_string(), "new".to_string()])
    );
}

#[tokio::test]
async fn test_removing_absent_key_is_noop() {
    let f = fixture();
    assert_eq!(f.engine.remove("User:404").await.unwrap(), 0);
    assert_eq!(f.engine.remove("User:404").await.unwrap(), 0);
    assert_eq!(f.engine.remove_keys(&[]).await.unwrap(), 0);
    assert_eq!(f.engine.remove_by_tag("nothing").await.unwrap(), 0);
}

#[tokio::test]
async fn test_sweep_reclaims_schedule_only_keys() {
    let f = fixture();
    f.engine
        .set("User:1", Some(&ada()), None, &["t"])
        .await
        .unwrap();
    f.engine
        .schedule()
        .set_key_expiry("User:1", f.clock.now() - ChronoDuration::minutes(1))
        .await
        .unwrap();

    let reclaimed = f.engine.remove_expired_keys().await.unwrap();

    assert_eq!(reclaimed, vec!["User:1".to_string()]);
    assert!(!f.engine.exists("User:1").await.unwrap());
    assert!(f.engine.keys_for_tag("t").await.unwrap().is_empty());
    assert!(f.engine.tags_for_key("User:1").await.unwrap().is_empty());
    assert!(
        f.engine
            .schedule()
            .get_expired_keys(f.clock.now() + ChronoDuration::days(365))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_reconciliation_removes_only_stale_references() {
    let f = fixture();
    f.engine
        .set("User:1", Some(&ada()), None, &["shared", "one"])
        .await
        .unwrap();
    f.engine
        .set("User:2", Some(&ada()), None, &["shared", "two"])
        .await
        .unwrap();

    // Deleted behind the engine's back.
    f.store.delete_key("User:1").await.unwrap();

    let reclaimed = f.engine.remove_expired_keys().await.unwrap();
    assert_eq!(reclaimed, vec!["User:1".to_string()]);

    assert_eq!(
        f.engine.keys_for_tag("shared").await.unwrap(),
        HashSet::from(["User:2".to_string()])
    );
    assert!(f.engine.keys_for_tag("one").await.unwrap().is_empty());
    assert!(f.engine.tags_for_key("User:1").await.unwrap().is_empty());
    assert_eq!(
        f.engine.keys_for_tag("two").await.unwrap(),
        HashSet::from(["User:2".to_string()])
    );
}

#[tokio::test]
async fn test_expiring_user_scenario() {
    let f = fixture();
    let expiry = f.clock.now() + ChronoDuration::seconds(30);

    f.engine
        .set("user:42", Some(&ada()), Some(expiry), &["vip", "beta"])
        .await
        .unwrap();

    assert_eq!(f.engine.get::<User>("user:42").await.unwrap(), Some(ada()));
    assert_eq!(f.engine.get_by_tag::<User>("vip").await.unwrap(), vec![ada()]);

    f.clock.advance(Duration::from_secs(31));

    assert_eq!(f.engine.get::<User>("user:42").await.unwrap(), None);
    assert!(f.engine.get_by_tag::<User>("vip").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_push_path_cleans_indexes() {
    let f = fixture();
    let registry = ExpiryHandlerRegistry::new();
    let handler = registry.ensure(&f.engine).await.unwrap();
    assert!(handler.is_listening());

    let expiry = f.clock.now() + ChronoDuration::seconds(5);
    f.engine
        .set("User:1", Some(&ada()), Some(expiry), &["t"])
        .await
        .unwrap();

    f.clock.advance(Duration::from_secs(10));
    assert_eq!(f.store.purge_expired().await, vec!["User:1".to_string()]);

    let mut remaining = f.engine.keys_for_tag("t").await.unwrap();
    for _ in 0..100 {
        if remaining.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        remaining = f.engine.keys_for_tag("t").await.unwrap();
    }
    assert!(remaining.is_empty());
    assert!(f.engine.tags_for_key("User:1").await.unwrap().is_empty());

    registry.stop_all();
}

#[tokio::test]
async fn test_undecodable_entry_does_not_abort_tag_lookup() {
    let f = fixture();
    f.engine
        .set("User:1", Some(&ada()), None, &["t"])
        .await
        .unwrap();
    f.engine
        .set("User:2", Some(&ada()), None, &["t"])
        .await
        .unwrap();
    f.store
        .set_string("User:2", b"not an envelope".to_vec(), None)
        .await
        .unwrap();

    let results = f.engine.get_by_tag_results::<User>("t").await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(e) if e.is_decode())));

    assert_eq!(f.engine.get_by_tag::<User>("t").await.unwrap(), vec![ada()]);
    assert!(f.engine.get::<User>("User:2").await.unwrap_err().is_decode());
}

#[tokio::test]
async fn test_service_over_in_memory_store() {
    let config = CacheConfiguration::new()
        .with_root_namespace("orders")
        .with_manual_expiry(true)
        .with_sweep_interval(Duration::from_secs(60));
    let store = Arc::new(InMemoryStore::new());
    let service = TagCacheService::with_store(store.clone(), config).await.unwrap();

    assert!(service.is_listening());
    assert!(service.is_sweeping());

    let cache = service.cache();
    cache.save(42, &ada(), None, &["vip"]).await.unwrap();
    assert_eq!(cache.get::<User>(42).await.unwrap(), Some(ada()));
    assert!(
        store
            .set_members("orders:_cacheKeysByTag:vip")
            .await
            .unwrap()
            .contains("User:42")
    );

    service.shutdown().await.unwrap();
}

// Tests below need a Redis server on localhost:6379 with database 15 free.

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_round_trip_and_sweep() {
    let config = CacheConfiguration::new()
        .with_redis(
            tagcache_redis::RedisConfig::builder()
                .host("localhost")
                .database(15)
                .build(),
        )
        .with_root_namespace("tagcache-it")
        .with_expiry_events(false)
        .with_expiry_grace_period(Duration::ZERO);
    let service = TagCacheService::connect(config).await.unwrap();
    let engine = service.engine();

    engine
        .set("User:it", Some(&ada()), None, &["it"])
        .await
        .unwrap();
    assert_eq!(engine.get_by_tag::<User>("it").await.unwrap(), vec![ada()]);

    engine.store().delete_key("User:it").await.unwrap();
    let reclaimed = engine.remove_expired_keys().await.unwrap();
    assert!(reclaimed.contains(&"User:it".to_string()));
    assert!(engine.keys_for_tag("it").await.unwrap().is_empty());

    service.shutdown().await.unwrap();
}
