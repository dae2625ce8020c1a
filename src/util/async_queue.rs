use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::{failed_precondition, internal_error, FirestoreResult};
use crate::platform::runtime;

/// Identifies the kind of work scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    LruGarbageCollection,
    IndexBackfill,
    ClientMetadataRefresh,
}

type QueueTask = BoxFuture<'static, ()>;

/// Serial work queue: every enqueued operation runs to completion before the
/// next one starts, in enqueue order.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

struct AsyncQueueInner {
    sender: Sender<QueueTask>,
    shutting_down: AtomicBool,
    next_delayed_id: AtomicU64,
    delayed: Mutex<Vec<DelayedEntry>>,
}

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let queue = Self {
            inner: Arc::new(AsyncQueueInner {
                sender,
                shutting_down: AtomicBool::new(false),
                next_delayed_id: AtomicU64::new(1),
                delayed: Mutex::new(Vec::new()),
            }),
        };
        Self::start_worker(receiver);
        queue
    }

    fn start_worker(receiver: Receiver<QueueTask>) {
        runtime::spawn_detached(async move {
            while let Ok(task) = receiver.recv().await {
                task.await;
            }
            log::debug!("AsyncQueue worker drained");
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Schedules `operation` and resolves with its result once it ran.
    pub fn enqueue<F, T>(&self, operation: F) -> impl Future<Output = FirestoreResult<T>> + Send
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let scheduled = self.schedule(operation);
        async move {
            match scheduled {
                Ok(receiver) => receiver
                    .await
                    .map_err(|_| internal_error("AsyncQueue dropped an operation"))?,
                Err(err) => Err(err),
            }
        }
    }

    /// Schedules `operation` without waiting for it. Failures are logged.
    pub fn enqueue_and_forget<F>(&self, operation: F)
    where
        F: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        if let Err(err) = self.schedule(operation) {
            log::debug!("AsyncQueue rejected operation: {err}");
        }
    }

    /// Like [`AsyncQueue::enqueue_and_forget`], but still accepted after
    /// [`AsyncQueue::enter_restricted_mode`]. Used for shutdown work.
    pub fn enqueue_even_while_restricted<F, T>(
        &self,
        operation: F,
    ) -> impl Future<Output = FirestoreResult<T>> + Send
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let scheduled = self.push(operation);
        async move {
            match scheduled {
                Ok(receiver) => receiver
                    .await
                    .map_err(|_| internal_error("AsyncQueue dropped an operation"))?,
                Err(err) => Err(err),
            }
        }
    }

    /// Stops accepting regular operations. Pending delayed operations are cancelled.
    pub fn enter_restricted_mode(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let mut delayed = self.lock_delayed();
        for entry in delayed.drain(..) {
            entry.cancelled.store(true, Ordering::SeqCst);
        }
    }

    /// Runs `operation` on the queue after `delay` unless cancelled first.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        operation: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let id = self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.lock_delayed().push(DelayedEntry {
            id,
            timer_id,
            cancelled: Arc::clone(&cancelled),
        });

        let queue = self.clone();
        let flag = Arc::clone(&cancelled);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            queue.remove_delayed(id);
            if flag.load(Ordering::SeqCst) {
                return;
            }
            let flag_on_queue = Arc::clone(&flag);
            queue.enqueue_and_forget(async move {
                if flag_on_queue.load(Ordering::SeqCst) {
                    return Ok(());
                }
                operation().await
            });
        });

        DelayedOperation {
            timer_id,
            cancelled,
            queue: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.lock_delayed()
            .iter()
            .any(|entry| entry.timer_id == timer_id && !entry.cancelled.load(Ordering::SeqCst))
    }

    /// Resolves once every operation enqueued before this call has completed.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.enqueue_even_while_restricted(async { Ok(()) }).await
    }

    fn schedule<F, T>(&self, operation: F) -> FirestoreResult<oneshot::Receiver<FirestoreResult<T>>>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(failed_precondition(
                "The client has already been terminated.",
            ));
        }
        self.push(operation)
    }

    fn push<F, T>(&self, operation: F) -> FirestoreResult<oneshot::Receiver<FirestoreResult<T>>>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = async move {
            let result = operation.await;
            let _ = tx.send(result);
        }
        .boxed();
        self.inner
            .sender
            .try_send(task)
            .map_err(|err| internal_error(format!("AsyncQueue is closed: {err}")))?;
        Ok(rx)
    }

    fn remove_delayed(&self, id: u64) {
        self.lock_delayed().retain(|entry| entry.id != id);
    }

    fn lock_delayed(&self) -> std::sync::MutexGuard<'_, Vec<DelayedEntry>> {
        self.inner
            .delayed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
pub struct DelayedOperation {
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
    queue: std::sync::Weak<AsyncQueueInner>,
    id: u64,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(inner) = self.queue.upgrade() {
            let mut delayed = inner
                .delayed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            delayed.retain(|entry| entry.id != self.id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn runs_operations_in_enqueue_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for index in 0..5 {
            let log = Arc::clone(&log);
            pending.push(queue.enqueue(async move {
                runtime::sleep(Duration::from_millis((5 - index) as u64)).await;
                log.lock().unwrap().push(index);
                Ok(index)
            }));
        }
        for (index, fut) in pending.into_iter().enumerate() {
            assert_eq!(fut.await.unwrap(), index);
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn delayed_operation_can_be_cancelled() {
        let queue = AsyncQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let cancelled_counter = Arc::clone(&counter);
        let op = queue.enqueue_after_delay(TimerId::LruGarbageCollection, Duration::from_millis(20), move || async move {
            cancelled_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(queue.contains_delayed_operation(TimerId::LruGarbageCollection));
        op.cancel();
        assert!(!queue.contains_delayed_operation(TimerId::LruGarbageCollection));

        let fired_counter = Arc::clone(&counter);
        queue.enqueue_after_delay(TimerId::IndexBackfill, Duration::from_millis(10), move || async move {
            fired_counter.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });

        runtime::sleep(Duration::from_millis(80)).await;
        queue.drain().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn restricted_queue_rejects_new_work() {
        let queue = AsyncQueue::new();
        queue.enter_restricted_mode();
        let err = queue.enqueue(async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
        queue.enqueue_even_while_restricted(async { Ok(()) }).await.unwrap();
    }
}
