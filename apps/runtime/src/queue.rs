use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::Stream;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

/// In-process producer/consumer channel between request handlers and the background worker.
///
/// Producers never wait: the channel is unbounded, so `enqueue` is a synchronous push. The
/// consumer side is a single subscription at a time; a second `dequeue_all` stream waits until
/// the first one is dropped.
pub struct WorkQueue<T> {
    sender: mpsc::UnboundedSender<T>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
    depth: Arc<AtomicU64>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

type ReceiverGuard<T> = OwnedMutexGuard<mpsc::UnboundedReceiver<T>>;

impl<T> WorkQueue<T>
where
    T: Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            depth: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns `false` only when the consumer half has been closed.
    pub fn enqueue(&self, item: T) -> bool {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(item).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!("work queue closed; dropping item");
            return false;
        }
        true
    }

    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Lazy pull sequence that ends when `cancel` fires.
    pub fn dequeue_all(&self, cancel: CancellationToken) -> impl Stream<Item = T> + Send + 'static {
        let state: (
            Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
            Option<ReceiverGuard<T>>,
            Arc<AtomicU64>,
            CancellationToken,
        ) = (self.receiver.clone(), None, self.depth.clone(), cancel);

        futures::stream::unfold(state, |(receiver, guard, depth, cancel)| async move {
            let mut guard = match guard {
                Some(guard) => guard,
                None => tokio::select! {
                    biased;
                    () = cancel.cancelled() => return None,
                    guard = receiver.clone().lock_owned() => guard,
                },
            };

            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                item = guard.recv() => item,
            };

            next.map(|item| {
                depth.fetch_sub(1, Ordering::Relaxed);
                (item, (receiver, Some(guard), depth, cancel))
            })
        })
    }
}
