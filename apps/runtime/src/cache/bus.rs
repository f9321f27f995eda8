use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls, Socket};

use crate::cache::shared::CacheBackendError;

pub const INVALIDATION_CHANNEL: &str = "toolnexus_cache_invalidation";

const SUBSCRIBER_BUFFER: usize = 1024;
const RECONNECT_BASE: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Invalidation {
    Key { key: String },
    Prefix { prefix: String },
}

impl Invalidation {
    /// Every key starts with the empty prefix.
    pub fn clear_all() -> Self {
        Self::Prefix {
            prefix: String::new(),
        }
    }
}

/// Fan-out of invalidations to every cache instance, the publisher included.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    async fn publish(&self, invalidation: &Invalidation) -> Result<(), CacheBackendError>;

    fn subscribe(&self) -> broadcast::Receiver<Invalidation>;
}

pub fn memory() -> Arc<dyn InvalidationBus> {
    Arc::new(MemoryInvalidationBus::default())
}

pub struct MemoryInvalidationBus {
    sender: broadcast::Sender<Invalidation>,
}

impl Default for MemoryInvalidationBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self { sender }
    }
}

#[async_trait]
impl InvalidationBus for MemoryInvalidationBus {
    async fn publish(&self, invalidation: &Invalidation) -> Result<(), CacheBackendError> {
        // No live subscribers is not a failure.
        let _ = self.sender.send(invalidation.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.sender.subscribe()
    }
}

type ClientSlot = Arc<Mutex<Option<Client>>>;

/// LISTEN/NOTIFY over a dedicated connection; the shared query client is never used for LISTEN.
///
/// A supervisor task reconnects with capped exponential backoff when the listener connection
/// ends. Publishing fails with [`CacheBackendError::Unavailable`] while disconnected, and every
/// subscriber receives a clear-all prefix once the listener is back, since notifications sent
/// in the gap were lost.
pub struct PostgresInvalidationBus {
    client: ClientSlot,
    sender: broadcast::Sender<Invalidation>,
    supervisor: JoinHandle<()>,
}

impl PostgresInvalidationBus {
    pub async fn connect(database_url: &str) -> Result<Arc<dyn InvalidationBus>> {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let client: ClientSlot = Arc::new(Mutex::new(None));
        let pump = listen(database_url, &client, &sender).await?;
        tracing::info!(channel = INVALIDATION_CHANNEL, "cache invalidation listener ready");

        let supervisor = tokio::spawn(supervise(
            database_url.to_string(),
            client.clone(),
            sender.clone(),
            pump,
        ));
        Ok(Arc::new(Self {
            client,
            sender,
            supervisor,
        }))
    }
}

async fn listen(
    database_url: &str,
    slot: &ClientSlot,
    sender: &broadcast::Sender<Invalidation>,
) -> Result<JoinHandle<()>> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .context("connect cache invalidation listener")?;
    let pump = tokio::spawn(forward_notifications(connection, sender.clone()));
    if let Err(error) = client
        .batch_execute(&format!("LISTEN {INVALIDATION_CHANNEL}"))
        .await
    {
        pump.abort();
        return Err(error).context("subscribe to cache invalidation channel");
    }
    *slot.lock().await = Some(client);
    Ok(pump)
}

async fn forward_notifications(
    mut connection: Connection<Socket, NoTlsStream>,
    forward: broadcast::Sender<Invalidation>,
) {
    let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
    while let Some(message) = messages.next().await {
        match message {
            Ok(AsyncMessage::Notification(notification))
                if notification.channel() == INVALIDATION_CHANNEL =>
            {
                match serde_json::from_str::<Invalidation>(notification.payload()) {
                    Ok(invalidation) => {
                        let _ = forward.send(invalidation);
                    }
                    Err(error) => tracing::warn!(
                        reason = %error,
                        "malformed cache invalidation payload ignored"
                    ),
                }
            }
            Ok(_) => {}
            Err(error) => {
                tracing::error!(reason = %error, "cache invalidation listener connection error");
                break;
            }
        }
    }
}

async fn supervise(
    database_url: String,
    slot: ClientSlot,
    sender: broadcast::Sender<Invalidation>,
    mut pump: JoinHandle<()>,
) {
    loop {
        if let Err(error) = pump.await {
            tracing::warn!(reason = %error, "cache invalidation listener task failed");
        }
        slot.lock().await.take();
        tracing::warn!("cache invalidation listener lost; reconnecting");

        let mut attempt = 0_u32;
        pump = loop {
            tokio::time::sleep(reconnect_delay(attempt)).await;
            match listen(&database_url, &slot, &sender).await {
                Ok(pump) => break pump,
                Err(error) => {
                    tracing::warn!(
                        attempt,
                        reason = %format!("{error:#}"),
                        "cache invalidation listener reconnect failed"
                    );
                    attempt = attempt.saturating_add(1);
                }
            }
        };
        tracing::info!(attempt, "cache invalidation listener reconnected; clearing local tiers");
        let _ = sender.send(Invalidation::clear_all());
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    RECONNECT_BASE
        .saturating_mul(1_u32 << attempt.min(8))
        .min(RECONNECT_MAX)
}

#[async_trait]
impl InvalidationBus for PostgresInvalidationBus {
    async fn publish(&self, invalidation: &Invalidation) -> Result<(), CacheBackendError> {
        let payload = serde_json::to_string(invalidation)
            .map_err(|error| CacheBackendError::Db(error.to_string()))?;
        let client = self.client.lock().await;
        let Some(client) = client.as_ref() else {
            return Err(CacheBackendError::Unavailable(
                "invalidation listener is reconnecting".to_string(),
            ));
        };
        client
            .execute("SELECT pg_notify($1, $2)", &[&INVALIDATION_CHANNEL, &payload])
            .await
            .map_err(|error| CacheBackendError::Db(error.to_string()))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.sender.subscribe()
    }
}

impl Drop for PostgresInvalidationBus {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use std::time::Duration;

    use super::{Invalidation, InvalidationBus, MemoryInvalidationBus, reconnect_delay};

    #[tokio::test]
    async fn every_subscriber_receives_each_invalidation() -> Result<()> {
        let bus = MemoryInvalidationBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let message = Invalidation::Key {
            key: "admin:executions:p=1".to_string(),
        };
        bus.publish(&message).await?;
        assert_eq!(first.recv().await?, message);
        assert_eq!(second.recv().await?, message);
        Ok(())
    }

    #[test]
    fn invalidation_wire_format_is_tagged() -> Result<()> {
        let encoded = serde_json::to_string(&Invalidation::Prefix {
            prefix: "admin:metrics:".to_string(),
        })?;
        assert_eq!(encoded, r#"{"kind":"prefix","prefix":"admin:metrics:"}"#);
        Ok(())
    }

    #[test]
    fn reconnect_backoff_doubles_up_to_a_cap() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(250));
        assert_eq!(reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(reconnect_delay(3), Duration::from_secs(2));
        assert_eq!(reconnect_delay(7), Duration::from_secs(30));
        assert_eq!(reconnect_delay(u32::MAX), Duration::from_secs(30));
    }
}
