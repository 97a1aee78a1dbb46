//! Per-query context: cooperative cancellation plus an optional deadline.
//!
//! Scans check the context at row-iteration boundaries, the merger and
//! the spin-up coordinator wait on it with a timeout. `cancel()` wakes
//! any waiter immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Cloneable handle shared between the request task and its scanners.
#[derive(Clone)]
pub struct QueryContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    canceled: AtomicBool,
    deadline: Option<Instant>,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl QueryContext {
    /// Context without deadline; done only when canceled.
    pub fn background() -> Self {
        Self::with_deadline(None)
    }

    /// Context that is done once `timeout` elapses.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Some(Instant::now() + timeout))
    }

    fn with_deadline(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                canceled: AtomicBool::new(false),
                deadline,
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Cancel the query. Wakes all waiters immediately.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// True once the query was canceled or its deadline passed.
    pub fn is_done(&self) -> bool {
        if self.inner.canceled.load(Ordering::SeqCst) {
            return true;
        }
        match self.inner.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }

    /// Time left until the deadline, `None` for no deadline. Done
    /// contexts report a zero remainder.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Block for at most `timeout`, waking early on cancel or deadline.
    /// Returns true when the context is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_done() {
            return true;
        }
        let timeout = match self.remaining() {
            Some(rem) => rem.min(timeout),
            None => timeout,
        };
        let guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, _res) = self
            .inner
            .condvar
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
        self.is_done()
    }
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("canceled", &self.inner.canceled.load(Ordering::SeqCst))
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_not_done() {
        let ctx = QueryContext::background();
        assert!(!ctx.is_done());
        assert_eq!(ctx.remaining(), None);
    }

    #[test]
    fn test_cancel_marks_done() {
        let ctx = QueryContext::background();
        ctx.cancel();
        assert!(ctx.is_done());
    }

    #[test]
    fn test_deadline_expires() {
        let ctx = QueryContext::with_timeout(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert!(ctx.is_done());
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let ctx = QueryContext::background();
        let ctx2 = ctx.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let done = ctx2.wait_timeout(Duration::from_secs(10));
            (done, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        ctx.cancel();
        let (done, elapsed) = handle.join().unwrap();
        assert!(done);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_timeout_expires_normally() {
        let ctx = QueryContext::background();
        assert!(!ctx.wait_timeout(Duration::from_millis(10)));
    }
}
