use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::lease::{LeaseGuard, WorkerLock};
use crate::queue::WorkQueue;

/// Attempts per item: the first try plus one immediate retry.
const MAX_ATTEMPTS: u32 = 2;

#[async_trait]
pub trait ItemProcessor<T>: Send + Sync {
    async fn process(&self, item: &T) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub lease_name: String,
    pub lease_ttl: Duration,
    pub lease_poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Leading,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHealthSnapshot {
    pub state: WorkerState,
    pub processed: u64,
    pub failed_attempts: u64,
    pub discarded: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct WorkerHealth {
    inner: Mutex<WorkerHealthSnapshot>,
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self {
            inner: Mutex::new(WorkerHealthSnapshot {
                state: WorkerState::Idle,
                processed: 0,
                failed_attempts: 0,
                discarded: 0,
                last_processed_at: None,
            }),
        }
    }
}

impl WorkerHealth {
    pub fn snapshot(&self) -> WorkerHealthSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> WorkerState {
        self.snapshot().state
    }

    fn update(&self, apply: impl FnOnce(&mut WorkerHealthSnapshot)) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut inner);
    }

    fn set_state(&self, state: WorkerState) {
        self.update(|inner| inner.state = state);
    }
}

enum LeadOutcome {
    Stopped,
    LeaseLost,
}

/// Leader-only consumer of a [`WorkQueue`].
///
/// Every instance runs one; only the holder of `config.lease_name` drains the queue, the rest
/// poll the lease every `lease_poll_interval`. Failed items are retried once and then discarded,
/// so a single bad item never stops the loop.
pub struct BackgroundWorker<T> {
    queue: WorkQueue<T>,
    processor: Arc<dyn ItemProcessor<T>>,
    lock: WorkerLock,
    config: WorkerConfig,
    health: Arc<WorkerHealth>,
}

impl<T> BackgroundWorker<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        queue: WorkQueue<T>,
        processor: Arc<dyn ItemProcessor<T>>,
        lock: WorkerLock,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            lock,
            config,
            health: Arc::new(WorkerHealth::default()),
        }
    }

    pub fn health(&self) -> Arc<WorkerHealth> {
        self.health.clone()
    }

    pub fn spawn(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        WorkerHandle { cancel, join }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            lease_name = %self.config.lease_name,
            holder_id = %self.lock.holder_id(),
            "background worker started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self
                .lock
                .try_acquire(&self.config.lease_name, self.config.lease_ttl)
                .await
            {
                Ok(Some(guard)) => {
                    self.health.set_state(WorkerState::Leading);
                    tracing::info!(
                        lease_name = %self.config.lease_name,
                        holder_id = %self.lock.holder_id(),
                        "worker lease acquired; draining queue"
                    );
                    match self.lead(guard, &cancel).await {
                        LeadOutcome::Stopped => break,
                        LeadOutcome::LeaseLost => {
                            self.health.set_state(WorkerState::Idle);
                            tracing::warn!(
                                lease_name = %self.config.lease_name,
                                "worker lease lost; returning to passive polling"
                            );
                        }
                    }
                }
                Ok(None) => {
                    self.health.set_state(WorkerState::Idle);
                    tracing::debug!(
                        lease_name = %self.config.lease_name,
                        "worker lease held by another instance"
                    );
                }
                Err(error) => {
                    self.health.set_state(WorkerState::Idle);
                    tracing::warn!(
                        lease_name = %self.config.lease_name,
                        reason = %error,
                        "worker lease acquisition failed"
                    );
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.lease_poll_interval) => {}
            }
        }

        self.health.set_state(WorkerState::Idle);
        tracing::info!(lease_name = %self.config.lease_name, "background worker stopped");
    }

    async fn lead(&self, mut guard: LeaseGuard, cancel: &CancellationToken) -> LeadOutcome {
        let pull_cancel = cancel.child_token();
        let stream = self.queue.dequeue_all(pull_cancel.clone());
        tokio::pin!(stream);

        let renew_every = (self.config.lease_ttl / 2).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break LeadOutcome::Stopped,
                _ = renew.tick() => match guard.renew(self.config.lease_ttl).await {
                    Ok(true) => {}
                    Ok(false) => break LeadOutcome::LeaseLost,
                    Err(error) => {
                        tracing::warn!(reason = %error, "worker lease renewal failed");
                        break LeadOutcome::LeaseLost;
                    }
                },
                item = stream.next() => match item {
                    Some(item) => self.process_with_retry(&item).await,
                    None => break LeadOutcome::Stopped,
                },
            }
        };
        pull_cancel.cancel();

        if matches!(outcome, LeadOutcome::Stopped) {
            self.health.set_state(WorkerState::Draining);
            let dropped = self.queue.depth();
            if dropped > 0 {
                tracing::warn!(dropped, "worker stopping; undrained items dropped");
            }
        }
        if let Err(error) = guard.release().await {
            tracing::warn!(reason = %error, "worker lease release failed");
        }
        outcome
    }

    async fn process_with_retry(&self, item: &T) {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.processor.process(item).await {
                Ok(()) => {
                    self.health.update(|inner| {
                        inner.processed += 1;
                        inner.last_processed_at = Some(Utc::now());
                    });
                    return;
                }
                Err(error) => {
                    self.health.update(|inner| inner.failed_attempts += 1);
                    if attempt < MAX_ATTEMPTS {
                        tracing::warn!(attempt, reason = %format!("{error:#}"), "item processing failed; retrying");
                    } else {
                        self.health.update(|inner| inner.discarded += 1);
                        tracing::error!(
                            attempts = attempt,
                            reason = %format!("{error:#}"),
                            "item processing failed; discarding"
                        );
                    }
                }
            }
        }
    }
}

pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Lets the in-flight item finish, then waits for the lease to be released.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.cancel.cancel();
        self.join.await
    }
}
