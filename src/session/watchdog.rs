//! Inactivity watchdog.
//!
//! A [`Watchdog`] runs as a background tokio task next to the protocol driver.
//! The driver calls [`Watchdog::touch`] after every successful exchange; if no
//! touch arrives within the threshold the expiry callback runs once and the
//! watchdog becomes inert.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// State shared between the handle and the timer task.
#[derive(Debug)]
struct Shared {
    threshold: Duration,
    last_touch: Mutex<Instant>,
    fired: AtomicBool,
    cancelled: AtomicBool,
}

impl Shared {
    fn last_touch(&self) -> Instant {
        *self.last_touch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_touch()) >= self.threshold
    }
}

/// Cancellable idle timer with a one-shot expiry callback.
///
/// Dropping the handle cancels the timer, so a watchdog never outlives the
/// session that armed it.
#[derive(Debug)]
pub struct Watchdog {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start a watchdog that calls `on_expired` once `threshold` passes without a touch.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F, Fut>(threshold: Duration, on_expired: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            threshold,
            last_touch: Mutex::new(Instant::now()),
            fired: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });

        let timer = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            loop {
                time::sleep_until(timer.last_touch() + timer.threshold).await;

                if timer.cancelled.load(Ordering::Acquire) {
                    return;
                }
                if timer.is_expired(Instant::now()) {
                    timer.fired.store(true, Ordering::Release);
                    tracing::debug!(threshold_ms = timer.threshold.as_millis() as u64, "watchdog: expired");
                    on_expired().await;
                    return;
                }
            }
        });

        Self {
            shared,
            task: Some(task),
        }
    }

    /// Record activity, pushing the expiry back by a full threshold.
    pub fn touch(&self) {
        *self
            .shared
            .last_touch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Stop the watchdog permanently.
    ///
    /// A no-op if already cancelled. Once the callback has started it is
    /// allowed to finish.
    pub fn cancel(&mut self) {
        self.shared.cancelled.store(true, Ordering::Release);
        if let Some(task) = self.task.take()
            && !self.shared.fired.load(Ordering::Acquire)
        {
            task.abort();
        }
    }

    /// Check if the expiry callback has run (or is running).
    pub fn has_fired(&self) -> bool {
        self.shared.fired.load(Ordering::Acquire)
    }

    /// Check if the watchdog can still fire.
    pub fn is_active(&self) -> bool {
        !self.has_fired() && !self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Time of the last recorded activity.
    pub fn last_touch(&self) -> Instant {
        self.shared.last_touch()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}
