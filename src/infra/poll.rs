//! Cancellable waiting primitives shared by every "wait up to N, check every M" loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

/// Clonable cancellation flag. Cancelling is sticky and visible to every clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close underneath us.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps for `duration` unless cancelled first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: Option<&CancelToken>) -> bool {
    match cancel {
        Some(token) => {
            if token.is_cancelled() {
                return false;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => false,
                _ = sleep(duration) => !token.is_cancelled(),
            }
        }
        None => {
            sleep(duration).await;
            true
        }
    }
}

/// Runs `check` immediately and then every `interval` until it yields a value,
/// the deadline passes, or the token is cancelled.
///
/// The last sleep is shortened to land on the deadline, and one final check
/// runs at the deadline, so a condition that becomes true right at the end is
/// still observed.
pub async fn poll_until<T, F, Fut>(
    deadline: Instant,
    interval: Duration,
    cancel: Option<&CancelToken>,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    loop {
        if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
            return None;
        }

        if let Some(value) = check().await {
            return Some(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return None;
        }

        let wait = interval.min(deadline - now);
        if !sleep_or_cancel(wait, cancel).await {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_first_value() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = poll_until(start + Duration::from_secs(10), Duration::from_secs(2), None, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { (n == 2).then_some(n) }
        })
        .await;

        assert_eq!(result, Some(2));
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_gives_up_at_deadline() {
        let start = Instant::now();
        let result: Option<()> =
            poll_until(start + Duration::from_secs(5), Duration::from_secs(2), None, || async {
                None
            })
            .await;

        assert!(result.is_none());
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_stops_promptly_on_cancel() {
        let token = CancelToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(2500)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result: Option<()> = poll_until(
            start + Duration::from_secs(60),
            Duration::from_secs(10),
            Some(&token),
            || async { None },
        )
        .await;

        assert!(result.is_none());
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }
}
