use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;

use super::{CacheBackendError, Invalidation, PlatformCache, SharedTier, bus, shared};

const TTL: Duration = Duration::from_secs(60);

async fn counted(counter: &AtomicU32, value: u32) -> Result<u32> {
    counter.fetch_add(1, Ordering::SeqCst);
    Ok(value)
}

#[tokio::test]
async fn second_instance_reads_through_the_shared_tier() -> Result<()> {
    let tier = shared::memory();
    let bus = bus::memory();
    let first = PlatformCache::new(Some(tier.clone()), Some(bus.clone()));
    let second = PlatformCache::new(Some(tier), Some(bus));
    let calls = AtomicU32::new(0);

    let a: u32 = first.get_or_create("admin:tools", TTL, || counted(&calls, 7)).await?;
    let b: u32 = second.get_or_create("admin:tools", TTL, || counted(&calls, 8)).await?;
    assert_eq!((a, b), (7, 7));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn removal_on_one_instance_evicts_every_local_tier() -> Result<()> {
    let tier = shared::memory();
    let bus = bus::memory();
    let writer = PlatformCache::new(Some(tier.clone()), Some(bus.clone()));
    let reader = PlatformCache::new(Some(tier), Some(bus));
    let calls = AtomicU32::new(0);

    let _: u32 = reader.get_or_create("admin:tool:42", TTL, || counted(&calls, 1)).await?;
    writer.remove("admin:tool:42").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let refreshed: u32 = reader
        .get_or_create("admin:tool:42", TTL, || counted(&calls, 2))
        .await?;
    assert_eq!(refreshed, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn prefix_removal_evicts_matching_keys_only() -> Result<()> {
    let tier = shared::memory();
    let bus = bus::memory();
    let writer = PlatformCache::new(Some(tier.clone()), Some(bus.clone()));
    let reader = PlatformCache::new(Some(tier), Some(bus));
    let calls = AtomicU32::new(0);

    let _: u32 = reader.get_or_create("admin:executions:p=1", TTL, || counted(&calls, 1)).await?;
    let _: u32 = reader.get_or_create("admin:executions:p=2", TTL, || counted(&calls, 1)).await?;
    let _: u32 = reader.get_or_create("admin:metrics:base64", TTL, || counted(&calls, 1)).await?;
    writer.remove_by_prefix("admin:executions:").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let kept: u32 = reader
        .get_or_create("admin:metrics:base64", TTL, || counted(&calls, 9))
        .await?;
    let evicted: u32 = reader
        .get_or_create("admin:executions:p=1", TTL, || counted(&calls, 9))
        .await?;
    assert_eq!((kept, evicted), (1, 9));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test]
async fn concurrent_cold_callers_share_one_computation() -> Result<()> {
    let cache = PlatformCache::new(Some(shared::memory()), None);
    let calls = Arc::new(AtomicU32::new(0));

    let callers = (0..16).map(|_| {
        let calls = calls.clone();
        let cache = &cache;
        async move {
            cache
                .get_or_create("admin:executions:hot", TTL, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, anyhow::Error>(vec!["a".to_string(), "b".to_string()])
                })
                .await
        }
    });
    let results = futures::future::join_all(callers).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result?, vec!["a".to_string(), "b".to_string()]);
    }
    Ok(())
}

#[tokio::test]
async fn factory_errors_propagate_and_are_not_cached() -> Result<()> {
    let cache = PlatformCache::local_only();
    let failed: Result<u32> = cache
        .get_or_create("admin:flaky", TTL, || async { Err(anyhow!("ledger offline")) })
        .await;
    assert!(failed.is_err());

    let recovered: u32 = cache
        .get_or_create("admin:flaky", TTL, || async { Ok::<_, anyhow::Error>(3) })
        .await?;
    assert_eq!(recovered, 3);
    Ok(())
}

#[tokio::test]
async fn local_entries_expire_after_ttl() -> Result<()> {
    let cache = PlatformCache::local_only();
    let calls = AtomicU32::new(0);
    let short = Duration::from_millis(20);

    let _: u32 = cache.get_or_create("k", short, || counted(&calls, 1)).await?;
    let _: u32 = cache.get_or_create("k", short, || counted(&calls, 1)).await?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let _: u32 = cache.get_or_create("k", short, || counted(&calls, 1)).await?;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

struct UnavailableTier;

#[async_trait]
impl SharedTier for UnavailableTier {
    async fn get(&self, _key: &str) -> Result<Option<Value>, CacheBackendError> {
        Err(CacheBackendError::Unavailable("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: &Value, _ttl: Duration) -> Result<(), CacheBackendError> {
        Err(CacheBackendError::Unavailable("connection refused".to_string()))
    }

    async fn remove(&self, _key: &str) -> Result<(), CacheBackendError> {
        Err(CacheBackendError::Unavailable("connection refused".to_string()))
    }

    async fn remove_by_prefix(&self, _prefix: &str) -> Result<u64, CacheBackendError> {
        Err(CacheBackendError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn unavailable_shared_tier_degrades_to_local_only() -> Result<()> {
    let cache = PlatformCache::new(Some(Arc::new(UnavailableTier)), None);
    let calls = AtomicU32::new(0);

    let first: u32 = cache.get_or_create("admin:tools", TTL, || counted(&calls, 5)).await?;
    let second: u32 = cache.get_or_create("admin:tools", TTL, || counted(&calls, 6)).await?;
    assert_eq!((first, second), (5, 5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.is_degraded());

    cache.remove("admin:tools").await;
    let third: u32 = cache.get_or_create("admin:tools", TTL, || counted(&calls, 6)).await?;
    assert_eq!(third, 6);
    Ok(())
}

#[tokio::test]
async fn removal_mid_computation_starts_a_fresh_flight() -> Result<()> {
    let cache = Arc::new(PlatformCache::local_only());
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let slow = tokio::spawn({
        let cache = cache.clone();
        async move {
            cache
                .get_or_create("admin:executions:list", TTL, || async move {
                    let _ = started_tx.send(());
                    release_rx.await?;
                    Ok::<_, anyhow::Error>(1_u32)
                })
                .await
        }
    });
    started_rx.await?;
    cache.remove("admin:executions:list").await;

    let calls = AtomicU32::new(0);
    let fresh: u32 = tokio::time::timeout(
        Duration::from_secs(1),
        cache.get_or_create("admin:executions:list", TTL, || counted(&calls, 2)),
    )
    .await??;
    assert_eq!(fresh, 2);

    let _ = release_tx.send(());
    assert_eq!(slow.await??, 1);

    let cached: u32 = cache
        .get_or_create("admin:executions:list", TTL, || counted(&calls, 3))
        .await?;
    assert_eq!(cached, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn clear_all_invalidation_empties_the_local_tier() -> Result<()> {
    let bus = bus::memory();
    let cache = PlatformCache::new(None, Some(bus.clone()));
    let calls = AtomicU32::new(0);

    let _: u32 = cache.get_or_create("admin:executions:p=1", TTL, || counted(&calls, 1)).await?;
    let _: u32 = cache.get_or_create("admin:metrics:uuid:", TTL, || counted(&calls, 1)).await?;
    bus.publish(&Invalidation::clear_all()).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let executions: u32 = cache
        .get_or_create("admin:executions:p=1", TTL, || counted(&calls, 2))
        .await?;
    let metrics: u32 = cache
        .get_or_create("admin:metrics:uuid:", TTL, || counted(&calls, 2))
        .await?;
    assert_eq!((executions, metrics), (2, 2));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    Ok(())
}
