//! Cross-thread signalling primitives
//!
//! `CancelToken` is handed to every blocking demuxer call so that closing a
//! session interrupts I/O without callbacks. `Wakeup` is a sticky, timed
//! notification used by the read thread to sleep while queues are full.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Notification that is remembered until consumed.
///
/// A `notify()` issued while nobody waits makes the next `wait_timeout()`
/// return immediately.
#[derive(Debug, Default)]
pub struct Wakeup {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_all();
    }

    /// Wait until notified or until `timeout` elapses. Returns true when a
    /// notification was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_wakeup_is_sticky() {
        let wakeup = Wakeup::new();
        wakeup.notify();
        let start = Instant::now();
        assert!(wakeup.wait_timeout(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
        // Consumed
        assert!(!wakeup.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_wakeup_from_other_thread() {
        let wakeup = Arc::new(Wakeup::new());
        let notifier = wakeup.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });
        assert!(wakeup.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
