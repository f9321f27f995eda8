use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::db::RuntimeDb;

#[derive(Debug, thiserror::Error)]
pub enum CacheBackendError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Cross-instance cache tier. Entries are replaced wholesale and expire on their own.
#[async_trait]
pub trait SharedTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheBackendError>;

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheBackendError>;

    async fn remove(&self, key: &str) -> Result<(), CacheBackendError>;

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64, CacheBackendError>;
}

pub fn memory() -> Arc<dyn SharedTier> {
    Arc::new(MemorySharedTier::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn SharedTier> {
    Arc::new(PostgresSharedTier { db })
}

#[derive(Default)]
pub struct MemorySharedTier {
    entries: Mutex<HashMap<String, (Value, Instant)>>,
}

#[async_trait]
impl SharedTier for MemorySharedTier {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheBackendError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .and_then(|(value, expires_at)| (*expires_at > now).then(|| value.clone())))
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheBackendError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value.clone(), now + ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheBackendError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64, CacheBackendError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

struct PostgresSharedTier {
    db: Arc<RuntimeDb>,
}

#[async_trait]
impl SharedTier for PostgresSharedTier {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheBackendError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT value FROM cache_entries WHERE cache_key = $1 AND expires_at_utc > $2",
                &[&key, &Utc::now()],
            )
            .await
            .map_err(|error| CacheBackendError::Db(error.to_string()))?;
        row.map(|row| row.try_get::<_, Value>("value"))
            .transpose()
            .map_err(|error| CacheBackendError::Db(error.to_string()))
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheBackendError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|error| CacheBackendError::Db(format!("invalid ttl: {error}")))?;
        let expires_at_utc = Utc::now() + ttl;
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO cache_entries (cache_key, value, expires_at_utc)
                VALUES ($1, $2, $3)
                ON CONFLICT (cache_key) DO UPDATE
                   SET value = EXCLUDED.value,
                       expires_at_utc = EXCLUDED.expires_at_utc
                "#,
                &[&key, value, &expires_at_utc],
            )
            .await
            .map_err(|error| CacheBackendError::Db(error.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheBackendError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute("DELETE FROM cache_entries WHERE cache_key = $1", &[&key])
            .await
            .map_err(|error| CacheBackendError::Db(error.to_string()))?;
        Ok(())
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64, CacheBackendError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                "DELETE FROM cache_entries WHERE left(cache_key, length($1::text)) = $1::text",
                &[&prefix],
            )
            .await
            .map_err(|error| CacheBackendError::Db(error.to_string()))
    }
}
