//! Supervised long-running tasks.
//!
//! A supervised task is restarted whenever it returns an error, with
//! exponentially growing delays capped at one minute. A clean return stops
//! the loop, as does the emergency lockdown flag.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

/// Runs `task` until it succeeds or lockdown is engaged.
pub async fn supervise<F, Fut>(name: &str, lockdown: Arc<AtomicBool>, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut delay = Duration::from_secs(1);
    loop {
        if lockdown.load(Ordering::SeqCst) {
            log::warn!("{name}: lockdown engaged, not starting");
            return;
        }
        match task().await {
            Ok(()) => {
                log::info!("{name}: finished");
                return;
            }
            Err(e) => {
                log::warn!("{name}: failed: {e:#}; restarting in {delay:?}");
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_RESTART_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn restarts_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let lockdown = Arc::new(AtomicBool::new(false));

        let counter = Arc::clone(&attempts);
        let started = tokio::time::Instant::now();
        supervise("flaky", lockdown, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("not yet");
                }
                Ok(())
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two restarts: one second, then two.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn lockdown_stops_restarts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let lockdown = Arc::new(AtomicBool::new(false));

        let counter = Arc::clone(&attempts);
        let flag = Arc::clone(&lockdown);
        supervise("doomed", Arc::clone(&lockdown), move || {
            let counter = Arc::clone(&counter);
            let flag = Arc::clone(&flag);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                flag.store(true, Ordering::SeqCst);
                anyhow::bail!("always fails");
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
