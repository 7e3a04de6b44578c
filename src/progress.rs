//! Periodic progress reporting alongside blocking stage work.
//!
//! A stage that blocks for a long time (download, unpack) spawns one of
//! these before the blocking call and stops it right after, success or
//! failure, so a reporter never outlives its stage.

use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A cancellable periodic task writing progress into the condition store.
pub struct ProgressTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ProgressTask {
    /// Spawn a reporter invoking `tick` every `period`.
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The zeroth tick fires immediately; skip it so the first
            // sample lands one full period in.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = interval.tick() => tick().await,
                }
            }
        });
        Self { stop, handle }
    }

    /// Signal the reporter to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn reporter_ticks_then_stops() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let task = ProgressTask::spawn(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(55)).await;
        task.stop().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least 2 ticks, saw {seen}");
        let after = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(after, ticks.load(Ordering::SeqCst), "reporter kept running");
    }
}
