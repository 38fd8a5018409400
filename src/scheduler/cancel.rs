use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Run-wide cooperative cancellation flag.
///
/// The scheduler cancels the token when the run deadline expires. Operators
/// are expected to poll [`CancelToken::is_cancelled`] at safe points, or to
/// wait on [`CancelToken::wait_timeout`] instead of sleeping.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks for at most `timeout`, returning early with `true` once the
    /// token is cancelled. A timeout too large to schedule waits for the
    /// cancellation alone.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let deadline = Instant::now().checked_add(timeout);
        let mut cancelled = flag.lock().unwrap_or_else(PoisonError::into_inner);

        while !*cancelled {
            let Some(deadline) = deadline else {
                cancelled = signal.wait(cancelled).unwrap_or_else(PoisonError::into_inner);
                continue;
            };

            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            cancelled = signal
                .wait_timeout(cancelled, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        *cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_returns_false_without_cancel() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = waiter.wait_timeout(Duration::from_secs(30));
            (cancelled, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        let (cancelled, elapsed) = handle.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(30));
    }

    #[test]
    fn test_unbounded_wait_ends_on_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = thread::spawn(move || waiter.wait_timeout(Duration::MAX));

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        assert!(handle.join().unwrap());
    }
}
