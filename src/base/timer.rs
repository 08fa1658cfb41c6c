//! Inactivity timer shared by the connection cache and the echo multiplexer.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

struct TimerState {
    last_activity: Mutex<Instant>,
    timeout: Duration,
}

/// Tracks the last use of a resource and cancels its scope once the resource
/// has been idle for `timeout`.
///
/// The watcher task exits early if the scope is cancelled by someone else.
#[derive(Clone)]
pub struct ActivityTimer {
    state: Arc<TimerState>,
}

impl ActivityTimer {
    /// Start watching. When the resource goes idle, `on_idle` runs first and
    /// then `scope` is cancelled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn cancel_after_inactivity<F>(
        scope: CancellationToken,
        timeout: Duration,
        on_idle: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(TimerState {
            last_activity: Mutex::new(Instant::now()),
            timeout,
        });
        let watched = Arc::clone(&state);

        tokio::spawn(async move {
            loop {
                let deadline = *watched.last_activity.lock() + watched.timeout;
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = sleep_until(deadline) => {
                        if watched.last_activity.lock().elapsed() >= watched.timeout {
                            break;
                        }
                    }
                }
            }
            tracing::trace!(timeout = ?watched.timeout, "resource idle, cancelling scope");
            on_idle();
            scope.cancel();
        });

        Self { state }
    }

    /// Record activity, pushing the idle deadline out by a full timeout.
    pub fn update(&self) {
        *self.state.last_activity.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.state.last_activity.lock().elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.state.timeout
    }
}

impl std::fmt::Debug for ActivityTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTimer")
            .field("timeout", &self.state.timeout)
            .field("idle_for", &self.idle_for())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_timeout() {
        let scope = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let _timer = ActivityTimer::cancel_after_inactivity(
            scope.clone(),
            Duration::from_secs(30),
            move || flag.store(true, Ordering::SeqCst),
        );

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(!scope.is_cancelled());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(scope.is_cancelled());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_extends_deadline() {
        let scope = CancellationToken::new();
        let timer =
            ActivityTimer::cancel_after_inactivity(scope.clone(), Duration::from_secs(10), || {});

        tokio::time::sleep(Duration::from_secs(8)).await;
        timer.update();
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(!scope.is_cancelled());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(scope.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_skips_callback() {
        let scope = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let _timer = ActivityTimer::cancel_after_inactivity(
            scope.clone(),
            Duration::from_secs(5),
            move || flag.store(true, Ordering::SeqCst),
        );

        scope.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
