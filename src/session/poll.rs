//! Background status polling for a template VM session.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Handle to a spawned poll loop. Dropping it aborts the task, so a
/// session that goes away never leaves a timer running.
pub struct PollHandle {
    handle: JoinHandle<()>,
}

impl PollHandle {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn a loop that awaits `poll` once per `period`.
///
/// Ticks are strictly sequential: a slow poll delays the next tick rather
/// than overlapping it, and missed ticks are skipped instead of bursting.
pub(crate) fn spawn_poll_task<F, Fut>(period: Duration, mut poll: F) -> PollHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let handle = tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            poll().await;
        }
    });

    PollHandle { handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_poll_task_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handle = spawn_poll_task(Duration::from_millis(100), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        handle.stop();
        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected at least two ticks, got {after_stop}");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_dropping_the_handle_aborts_the_task() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handle = spawn_poll_task(Duration::from_millis(100), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(handle);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frozen = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), frozen);
    }
}
