use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::db::RuntimeDb;

pub const TELEMETRY_AGGREGATOR_LEASE: &str = "toolnexus:lock:telemetry-aggregator";

#[derive(Debug, thiserror::Error)]
pub enum LeaseStoreError {
    #[error("invalid lease ttl: {0}")]
    InvalidTtl(String),
    #[error("db error: {0}")]
    Db(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLease {
    pub lease_name: String,
    pub holder_id: String,
    pub expires_at_utc: DateTime<Utc>,
}

/// Compare-and-swap over lease rows. Implementations must make `try_acquire` atomic: it
/// succeeds only when no row exists, the row has expired, or the row is already held by
/// `holder_id` (renewal).
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn try_acquire(
        &self,
        lease_name: &str,
        holder_id: &str,
        expires_at_utc: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerLease>, LeaseStoreError>;

    async fn release(&self, lease_name: &str, holder_id: &str) -> Result<bool, LeaseStoreError>;

    async fn current(
        &self,
        lease_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerLease>, LeaseStoreError>;
}

pub fn memory() -> Arc<dyn LeaseStore> {
    Arc::new(MemoryLeaseStore::default())
}

pub fn postgres(db: Arc<RuntimeDb>) -> Arc<dyn LeaseStore> {
    Arc::new(PostgresLeaseStore { db })
}

#[derive(Default)]
struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, WorkerLease>>,
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        lease_name: &str,
        holder_id: &str,
        expires_at_utc: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerLease>, LeaseStoreError> {
        let mut leases = self.leases.lock().await;
        if let Some(existing) = leases.get(lease_name)
            && existing.expires_at_utc > now
            && existing.holder_id != holder_id
        {
            return Ok(None);
        }
        let lease = WorkerLease {
            lease_name: lease_name.to_string(),
            holder_id: holder_id.to_string(),
            expires_at_utc,
        };
        leases.insert(lease_name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease_name: &str, holder_id: &str) -> Result<bool, LeaseStoreError> {
        let mut leases = self.leases.lock().await;
        match leases.get(lease_name) {
            Some(existing) if existing.holder_id == holder_id => {
                leases.remove(lease_name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current(
        &self,
        lease_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerLease>, LeaseStoreError> {
        let leases = self.leases.lock().await;
        Ok(leases
            .get(lease_name)
            .filter(|lease| lease.expires_at_utc > now)
            .cloned())
    }
}

struct PostgresLeaseStore {
    db: Arc<RuntimeDb>,
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn try_acquire(
        &self,
        lease_name: &str,
        holder_id: &str,
        expires_at_utc: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerLease>, LeaseStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                INSERT INTO worker_leases (lease_name, holder_id, expires_at_utc)
                VALUES ($1, $2, $3)
                ON CONFLICT (lease_name) DO UPDATE
                   SET holder_id = EXCLUDED.holder_id,
                       expires_at_utc = EXCLUDED.expires_at_utc
                 WHERE worker_leases.expires_at_utc <= $4
                    OR worker_leases.holder_id = EXCLUDED.holder_id
                RETURNING lease_name, holder_id, expires_at_utc
                "#,
                &[&lease_name, &holder_id, &expires_at_utc, &now],
            )
            .await
            .map_err(|error| LeaseStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_lease_row)
            .transpose()
            .map_err(LeaseStoreError::Db)
    }

    async fn release(&self, lease_name: &str, holder_id: &str) -> Result<bool, LeaseStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let deleted = client
            .execute(
                "DELETE FROM worker_leases WHERE lease_name = $1 AND holder_id = $2",
                &[&lease_name, &holder_id],
            )
            .await
            .map_err(|error| LeaseStoreError::Db(error.to_string()))?;
        Ok(deleted > 0)
    }

    async fn current(
        &self,
        lease_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerLease>, LeaseStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT lease_name, holder_id, expires_at_utc
                  FROM worker_leases
                 WHERE lease_name = $1 AND expires_at_utc > $2
                "#,
                &[&lease_name, &now],
            )
            .await
            .map_err(|error| LeaseStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_lease_row)
            .transpose()
            .map_err(LeaseStoreError::Db)
    }
}

fn map_lease_row(row: &tokio_postgres::Row) -> Result<WorkerLease, String> {
    Ok(WorkerLease {
        lease_name: row.try_get("lease_name").map_err(|e| e.to_string())?,
        holder_id: row.try_get("holder_id").map_err(|e| e.to_string())?,
        expires_at_utc: row
            .try_get("expires_at_utc")
            .map_err(|e| e.to_string())?,
    })
}

/// Leader election handle for one process. Every instance in a fleet builds one with its own
/// `holder_id` over a shared [`LeaseStore`].
#[derive(Clone)]
pub struct WorkerLock {
    store: Arc<dyn LeaseStore>,
    holder_id: String,
}

impl WorkerLock {
    pub fn new(store: Arc<dyn LeaseStore>, holder_id: impl Into<String>) -> Self {
        Self {
            store,
            holder_id: holder_id.into(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Never waits for a contended lease: returns `Ok(None)` while another holder is valid.
    pub async fn try_acquire(
        &self,
        lease_name: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseGuard>, LeaseStoreError> {
        let now = Utc::now();
        let expires_at_utc = expiry_after(now, ttl)?;
        let acquired = self
            .store
            .try_acquire(lease_name, &self.holder_id, expires_at_utc, now)
            .await?;
        Ok(acquired.map(|lease| {
            tracing::debug!(
                lease_name = %lease.lease_name,
                holder_id = %lease.holder_id,
                expires_at_utc = %lease.expires_at_utc,
                "worker lease acquired"
            );
            LeaseGuard {
                store: self.store.clone(),
                lease,
                released: false,
            }
        }))
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, LeaseStoreError> {
    if ttl.is_zero() {
        return Err(LeaseStoreError::InvalidTtl("ttl must be positive".to_string()));
    }
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|error| LeaseStoreError::InvalidTtl(error.to_string()))?;
    now.checked_add_signed(ttl)
        .ok_or_else(|| LeaseStoreError::InvalidTtl("ttl overflows timestamp".to_string()))
}

/// Held lease. Dropping an unreleased guard schedules a best-effort release on the current
/// tokio runtime.
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    lease: WorkerLease,
    released: bool,
}

impl LeaseGuard {
    pub fn lease(&self) -> &WorkerLease {
        &self.lease
    }

    /// Extends the lease for the same holder. `Ok(false)` means leadership was lost.
    pub async fn renew(&mut self, ttl: Duration) -> Result<bool, LeaseStoreError> {
        let now = Utc::now();
        let expires_at_utc = expiry_after(now, ttl)?;
        match self
            .store
            .try_acquire(
                &self.lease.lease_name,
                &self.lease.holder_id,
                expires_at_utc,
                now,
            )
            .await?
        {
            Some(lease) => {
                self.lease = lease;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn release(mut self) -> Result<bool, LeaseStoreError> {
        self.released = true;
        let released = self
            .store
            .release(&self.lease.lease_name, &self.lease.holder_id)
            .await?;
        tracing::debug!(
            lease_name = %self.lease.lease_name,
            holder_id = %self.lease.holder_id,
            released,
            "worker lease released"
        );
        Ok(released)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                lease_name = %self.lease.lease_name,
                "lease guard dropped outside a runtime; lease will expire on its own"
            );
            return;
        };
        let store = self.store.clone();
        let lease_name = self.lease.lease_name.clone();
        let holder_id = self.lease.holder_id.clone();
        handle.spawn(async move {
            if let Err(error) = store.release(&lease_name, &holder_id).await {
                tracing::warn!(%lease_name, reason = %error, "lease release on drop failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{Result, anyhow};
    use chrono::Utc;

    use super::{LeaseStoreError, WorkerLock, memory};

    const LEASE: &str = "toolnexus:lock:test";

    #[tokio::test]
    async fn only_one_of_two_concurrent_contenders_acquires() -> Result<()> {
        let store = memory();
        let lock_a = WorkerLock::new(store.clone(), "instance-a");
        let lock_b = WorkerLock::new(store.clone(), "instance-b");

        let (a, b) = tokio::join!(
            lock_a.try_acquire(LEASE, Duration::from_secs(60)),
            lock_b.try_acquire(LEASE, Duration::from_secs(60)),
        );
        let (a, b) = (a?, b?);
        assert!(a.is_some() ^ b.is_some(), "exactly one contender must win");

        let winner = a.or(b).ok_or_else(|| anyhow!("no winner"))?;
        assert!(winner.release().await?);

        let again = lock_b.try_acquire(LEASE, Duration::from_secs(60)).await?;
        assert!(again.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_becomes_acquirable() -> Result<()> {
        let store = memory();
        let crashed = WorkerLock::new(store.clone(), "crashed");
        let survivor = WorkerLock::new(store.clone(), "survivor");

        let guard = crashed
            .try_acquire(LEASE, Duration::from_millis(30))
            .await?
            .ok_or_else(|| anyhow!("first acquire should succeed"))?;
        // A crashed holder never runs its release.
        let _crashed = std::mem::ManuallyDrop::new(guard);

        assert!(survivor.try_acquire(LEASE, Duration::from_secs(60)).await?.is_none());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(survivor.try_acquire(LEASE, Duration::from_secs(60)).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn dropping_a_guard_releases_the_lease() -> Result<()> {
        let store = memory();
        let lock = WorkerLock::new(store.clone(), "scoped");
        {
            let _guard = lock.try_acquire(LEASE, Duration::from_secs(60)).await?;
        }
        for _ in 0..20 {
            if store.current(LEASE, Utc::now()).await?.is_none() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Err(anyhow!("lease still held after guard drop"))
    }

    #[tokio::test]
    async fn renew_extends_for_holder_and_fails_after_takeover() -> Result<()> {
        let store = memory();
        let leader = WorkerLock::new(store.clone(), "leader");
        let challenger = WorkerLock::new(store.clone(), "challenger");

        let mut guard = leader
            .try_acquire(LEASE, Duration::from_millis(30))
            .await?
            .ok_or_else(|| anyhow!("acquire"))?;
        let first_expiry = guard.lease().expires_at_utc;
        assert!(guard.renew(Duration::from_secs(60)).await?);
        assert!(guard.lease().expires_at_utc > first_expiry);

        store.release(LEASE, "leader").await?;
        let taken = challenger.try_acquire(LEASE, Duration::from_secs(60)).await?;
        assert!(taken.is_some());
        assert!(!guard.renew(Duration::from_secs(60)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let lock = WorkerLock::new(memory(), "zero");
        let result = lock.try_acquire(LEASE, Duration::ZERO).await;
        assert!(matches!(result, Err(LeaseStoreError::InvalidTtl(_))));
    }
}
