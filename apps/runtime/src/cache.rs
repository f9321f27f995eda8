//! Two-tier read-through cache.
//!
//! Lookups go local map, then shared tier, then a single-flight factory call per key. Removals
//! delete from the shared tier and publish on the invalidation bus; every instance's eviction
//! task drops its local copy on receipt. Backend failures degrade to local-only operation.

pub mod bus;
pub mod shared;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use bus::{Invalidation, InvalidationBus, MemoryInvalidationBus, PostgresInvalidationBus};
pub use shared::{CacheBackendError, MemorySharedTier, SharedTier};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache serialization failed: {0}")]
    Serialization(String),
}

struct LocalEntry {
    value: Value,
    expires_at: Instant,
}

/// One in-progress factory call. Invalidating its key detaches it: current waiters still get
/// the result, later callers start a fresh flight, and the detached result is never stored.
#[derive(Default)]
struct Flight {
    cell: OnceCell<Value>,
    holders: AtomicUsize,
    detached: AtomicBool,
}

struct CacheInner {
    local: Mutex<HashMap<String, LocalEntry>>,
    shared: Option<Arc<dyn SharedTier>>,
    bus: Option<Arc<dyn InvalidationBus>>,
    in_flight: Mutex<HashMap<String, Arc<Flight>>>,
    degraded: AtomicBool,
}

pub struct PlatformCache {
    inner: Arc<CacheInner>,
    eviction: Option<JoinHandle<()>>,
}

impl PlatformCache {
    /// Spawns the eviction task when a bus is configured, so it must run inside a tokio runtime.
    pub fn new(
        shared: Option<Arc<dyn SharedTier>>,
        bus: Option<Arc<dyn InvalidationBus>>,
    ) -> Self {
        let inner = Arc::new(CacheInner {
            local: Mutex::new(HashMap::new()),
            shared,
            bus,
            in_flight: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        });
        let eviction = inner
            .bus
            .as_ref()
            .map(|bus| tokio::spawn(run_eviction(inner.clone(), bus.subscribe())));
        Self { inner, eviction }
    }

    pub fn local_only() -> Self {
        Self::new(None, None)
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Relaxed)
    }

    pub async fn get_or_create<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        factory: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        if let Some(value) = self.inner.local_get(key).await {
            if let Some(hit) = decode(key, value) {
                return Ok(hit);
            }
        }

        if let Some(value) = self.inner.shared_get(key).await {
            if let Some(hit) = decode::<T>(key, value.clone()) {
                self.inner.local_put(key, value, ttl).await;
                return Ok(hit);
            }
        }

        let inner = &self.inner;
        let flight = inner.join_flight(key).await;
        let current = flight.clone();
        let computed = flight
            .cell
            .get_or_try_init(move || async move {
                // An earlier flight for this key may have landed since the local miss.
                if let Some(value) = inner.local_get(key).await {
                    return Ok(value);
                }
                let created = factory().await?;
                let value = serde_json::to_value(&created)
                    .map_err(|error| E::from(CacheError::Serialization(error.to_string())))?;
                if inner.store_flight_result(key, &value, ttl, &current).await {
                    inner.shared_put(key, &value, ttl).await;
                }
                Ok::<Value, E>(value)
            })
            .await
            .cloned();
        self.inner.leave_flight(key, &flight).await;

        let value = computed?;
        serde_json::from_value(value)
            .map_err(|error| E::from(CacheError::Serialization(error.to_string())))
    }

    pub async fn remove(&self, key: &str) {
        self.inner.evict_key(key).await;
        if let Some(shared) = &self.inner.shared {
            match shared.remove(key).await {
                Ok(()) => self.inner.backend_ok(),
                Err(error) => self.inner.backend_failed("shared_remove", &error),
            }
        }
        self.inner
            .publish(&Invalidation::Key {
                key: key.to_string(),
            })
            .await;
    }

    pub async fn remove_by_prefix(&self, prefix: &str) {
        self.inner.evict_prefix(prefix).await;
        if let Some(shared) = &self.inner.shared {
            match shared.remove_by_prefix(prefix).await {
                Ok(removed) => {
                    self.inner.backend_ok();
                    tracing::debug!(%prefix, removed, "shared cache entries removed by prefix");
                }
                Err(error) => self.inner.backend_failed("shared_remove_by_prefix", &error),
            }
        }
        self.inner
            .publish(&Invalidation::Prefix {
                prefix: prefix.to_string(),
            })
            .await;
    }
}

impl Drop for PlatformCache {
    fn drop(&mut self) {
        if let Some(eviction) = self.eviction.take() {
            eviction.abort();
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(error) => {
            tracing::warn!(%key, reason = %error, "cached value has unexpected shape; recomputing");
            None
        }
    }
}

impl CacheInner {
    async fn local_get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut local = self.local.lock().await;
        match local.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                local.remove(key);
                None
            }
            None => None,
        }
    }

    async fn local_put(&self, key: &str, value: Value, ttl: Duration) {
        let now = Instant::now();
        let mut local = self.local.lock().await;
        local.retain(|_, entry| entry.expires_at > now);
        local.insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    async fn shared_get(&self, key: &str) -> Option<Value> {
        let shared = self.shared.as_ref()?;
        match shared.get(key).await {
            Ok(value) => {
                self.backend_ok();
                value
            }
            Err(error) => {
                self.backend_failed("shared_get", &error);
                None
            }
        }
    }

    async fn shared_put(&self, key: &str, value: &Value, ttl: Duration) {
        let Some(shared) = &self.shared else {
            return;
        };
        match shared.set(key, value, ttl).await {
            Ok(()) => self.backend_ok(),
            Err(error) => self.backend_failed("shared_set", &error),
        }
    }

    async fn publish(&self, invalidation: &Invalidation) {
        let Some(bus) = &self.bus else {
            return;
        };
        match bus.publish(invalidation).await {
            Ok(()) => self.backend_ok(),
            Err(error) => self.backend_failed("bus_publish", &error),
        }
    }

    async fn join_flight(&self, key: &str) -> Arc<Flight> {
        let mut in_flight = self.in_flight.lock().await;
        let flight = in_flight.entry(key.to_string()).or_default().clone();
        flight.holders.fetch_add(1, Ordering::AcqRel);
        flight
    }

    async fn leave_flight(&self, key: &str, flight: &Arc<Flight>) {
        let mut in_flight = self.in_flight.lock().await;
        let last = flight.holders.fetch_sub(1, Ordering::AcqRel) == 1;
        if last && in_flight.get(key).is_some_and(|current| Arc::ptr_eq(current, flight)) {
            in_flight.remove(key);
        }
    }

    /// Checked under the flight lock, so an eviction either detaches first or removes the entry
    /// stored here.
    async fn store_flight_result(
        &self,
        key: &str,
        value: &Value,
        ttl: Duration,
        flight: &Flight,
    ) -> bool {
        let _in_flight = self.in_flight.lock().await;
        if flight.detached.load(Ordering::Acquire) {
            tracing::debug!(%key, "key invalidated while computing; result not cached");
            return false;
        }
        self.local_put(key, value.clone(), ttl).await;
        true
    }

    async fn detach_flights(&self, matches: impl Fn(&str) -> bool) {
        self.in_flight.lock().await.retain(|key, flight| {
            if matches(key) {
                flight.detached.store(true, Ordering::Release);
                false
            } else {
                true
            }
        });
    }

    async fn evict_key(&self, key: &str) {
        self.detach_flights(|candidate| candidate == key).await;
        self.local.lock().await.remove(key);
    }

    async fn evict_prefix(&self, prefix: &str) {
        self.detach_flights(|candidate| candidate.starts_with(prefix)).await;
        self.local
            .lock()
            .await
            .retain(|key, _| !key.starts_with(prefix));
    }

    fn backend_failed(&self, operation: &'static str, error: &CacheBackendError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                operation,
                reason = %error,
                "shared cache backend unavailable; serving from local tier only"
            );
        }
    }

    fn backend_ok(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!("shared cache backend recovered");
        }
    }
}

async fn run_eviction(inner: Arc<CacheInner>, mut receiver: broadcast::Receiver<Invalidation>) {
    loop {
        match receiver.recv().await {
            Ok(Invalidation::Key { key }) => inner.evict_key(&key).await,
            Ok(Invalidation::Prefix { prefix }) => inner.evict_prefix(&prefix).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "cache invalidations lagged; clearing local tier");
                inner.evict_prefix("").await;
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::warn!("cache invalidation bus closed; local entries expire by ttl only");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests;
