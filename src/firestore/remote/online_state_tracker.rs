use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};

use crate::firestore::core::types::OnlineState;
use crate::firestore::error::FirestoreError;
use crate::firestore::remote::remote_syncer::RemoteStoreFuture;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

const LOG_TAG: &str = "OnlineStateTracker";

/// Failed watch stream attempts tolerated before reporting `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Receives every online state transition.
pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) -> RemoteStoreFuture<'static, ()> + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

/// Derives the client's [`OnlineState`] from watch stream health.
///
/// The state is `Unknown` until a watch stream either produces a message
/// (`Online`), fails [`MAX_WATCH_STREAM_FAILURES`] times, or stays silent for
/// the online state timeout (`Offline`).
#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    timeout: Duration,
    state: Mutex<TrackerState>,
}

impl OnlineStateTracker {
    /// `timeout` bounds how long a watch stream may stay unconfirmed before
    /// the client is reported `Offline`.
    pub fn new(queue: AsyncQueue, handler: OnlineStateHandler, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                queue,
                handler,
                timeout,
                state: Mutex::new(TrackerState {
                    state: OnlineState::Unknown,
                    watch_stream_failures: 0,
                    timer: None,
                    should_warn_client_is_offline: true,
                }),
            }),
        }
    }

    pub fn state(&self) -> OnlineState {
        self.lock().state
    }

    /// Called whenever the watch stream starts connecting. The first attempt
    /// after a reset arms the online state timer.
    pub async fn handle_watch_stream_start(&self) {
        let first_attempt = self.lock().watch_stream_failures == 0;
        if !first_attempt {
            return;
        }
        self.set_and_broadcast(OnlineState::Unknown).await;

        let tracker = self.clone();
        let timer = self.inner.queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            self.inner.timeout,
            move || async move {
                tracker.handle_timeout().await;
                Ok(())
            },
        );
        let previous = self.lock().timer.replace(timer);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Called when the watch stream closed with an error. An `Online` client
    /// falls back to `Unknown`; otherwise repeated failures mark it `Offline`.
    pub async fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let offline_reason = {
            let mut state = self.lock();
            if state.state == OnlineState::Online {
                None
            } else {
                state.watch_stream_failures += 1;
                if state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                    if let Some(timer) = state.timer.take() {
                        timer.cancel();
                    }
                    Some(format!(
                        "Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {error}"
                    ))
                } else {
                    return;
                }
            }
        };

        match offline_reason {
            None => self.set_and_broadcast(OnlineState::Unknown).await,
            Some(reason) => {
                self.log_client_offline_warning_if_necessary(&reason);
                self.set_and_broadcast(OnlineState::Offline).await;
            }
        }
    }

    /// Explicit transition, e.g. `Online` after a watch message or `Offline`
    /// when the network is disabled. Resets the failure count.
    pub async fn set(&self, new_state: OnlineState) {
        {
            let mut state = self.lock();
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                state.should_warn_client_is_offline = false;
            }
        }
        self.set_and_broadcast(new_state).await;
    }

    async fn handle_timeout(&self) {
        let still_unknown = {
            let mut state = self.lock();
            state.timer = None;
            state.state == OnlineState::Unknown
        };
        if !still_unknown {
            return;
        }
        self.log_client_offline_warning_if_necessary(&format!(
            "Backend didn't respond within {} seconds.",
            self.inner.timeout.as_secs()
        ));
        self.set_and_broadcast(OnlineState::Offline).await;
    }

    async fn set_and_broadcast(&self, new_state: OnlineState) {
        let changed = {
            let mut state = self.lock();
            let changed = state.state != new_state;
            state.state = new_state;
            changed
        };
        if changed {
            (self.inner.handler)(new_state).await;
        }
    }

    fn log_client_offline_warning_if_necessary(&self, details: &str) {
        let message = format!(
            "Could not reach Cloud Firestore backend. {details}\n\
             The client will operate in offline mode until it is able to \
             successfully connect to the backend."
        );
        let mut state = self.lock();
        if state.should_warn_client_is_offline {
            warn!("[{LOG_TAG}] {message}");
            state.should_warn_client_is_offline = false;
        } else {
            debug!("[{LOG_TAG}] {message}");
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;
    use crate::firestore::remote::remote_syncer::box_remote_store_future;
    use crate::platform::runtime;

    fn recording_tracker(timeout: Duration) -> (OnlineStateTracker, Arc<Mutex<Vec<OnlineState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: OnlineStateHandler = Arc::new(move |state| {
            let sink = Arc::clone(&sink);
            box_remote_store_future(async move {
                sink.lock().unwrap().push(state);
            })
        });
        (
            OnlineStateTracker::new(AsyncQueue::new(), handler, timeout),
            seen,
        )
    }

    #[tokio::test]
    async fn first_failure_goes_offline() {
        let (tracker, seen) = recording_tracker(Duration::from_secs(10));
        tracker.handle_watch_stream_start().await;
        assert_eq!(tracker.state(), OnlineState::Unknown);

        tracker
            .handle_watch_stream_failure(&unavailable("connection reset"))
            .await;
        assert_eq!(tracker.state(), OnlineState::Offline);

        tracker.set(OnlineState::Online).await;
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![OnlineState::Offline, OnlineState::Online]
        );
    }

    #[tokio::test]
    async fn online_failure_falls_back_to_unknown() {
        let (tracker, seen) = recording_tracker(Duration::from_secs(10));
        tracker.set(OnlineState::Online).await;
        tracker
            .handle_watch_stream_failure(&unavailable("connection reset"))
            .await;
        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![OnlineState::Online, OnlineState::Unknown]
        );
    }

    #[tokio::test]
    async fn silent_stream_times_out_to_offline() {
        let (tracker, seen) = recording_tracker(Duration::from_millis(20));
        tracker.handle_watch_stream_start().await;
        for _ in 0..50 {
            if tracker.state() == OnlineState::Offline {
                break;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(seen.lock().unwrap().clone(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn going_online_cancels_the_timer() {
        let (tracker, _seen) = recording_tracker(Duration::from_millis(20));
        tracker.handle_watch_stream_start().await;
        tracker.set(OnlineState::Online).await;
        runtime::sleep(Duration::from_millis(60)).await;
        assert_eq!(tracker.state(), OnlineState::Online);
    }
}
