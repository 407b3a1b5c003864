use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Cooperative cancellation flag shared across the pipeline.
///
/// Every suspension point (wire call, retry sleep, pacing sleep) checks this
/// flag; Ctrl-C sets it once and the walker unwinds after persisting its
/// cursor. Cloning is cheap and all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep that wakes early on cancellation. Returns true if the full
    /// duration elapsed, false if the sleep was cut short by `cancel()`.
    pub async fn sleep(&self, dur: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.inner.notify.notified() => false,
        }
    }
}

/// Install a Ctrl-C handler that trips the flag.
pub fn install_ctrl_c(flag: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing current write and shutting down");
            flag.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_returns_early_when_cancelled() {
        let flag = CancelFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });
        // Give the sleeper a chance to park before cancelling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.cancel();
        let completed = handle.await.unwrap();
        assert!(!completed);
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn sleep_completes_when_not_cancelled() {
        let flag = CancelFlag::new();
        assert!(flag.sleep(Duration::from_millis(5)).await);
    }
}
