use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

/// Coalesces a stream of work-pending signals keyed by entity identifier
/// into one batching window.
///
/// The first trigger opens the window; each trigger for a key not yet in
/// the window re-arms the idle timer; re-triggering a key already in the
/// window does nothing, so one noisy pod cannot livelock batching. The
/// window closes after `idle_duration` of silence or `max_duration`
/// overall, whichever comes first.
pub struct Batcher {
    triggered: Mutex<HashSet<String>>,
    signal_tx: mpsc::Sender<()>,
    signal_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    idle_duration: Duration,
    max_duration: Duration,
}

/// How long `wait` lingers for the first trigger before giving up and
/// letting the caller re-check its surroundings.
const QUIESCENT_TIMEOUT: Duration = Duration::from_secs(1);

impl Batcher {
    pub fn new(idle_duration: Duration, max_duration: Duration) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        Self {
            triggered: Mutex::new(HashSet::new()),
            signal_tx,
            signal_rx: tokio::sync::Mutex::new(signal_rx),
            idle_duration,
            max_duration,
        }
    }

    /// Marks work pending for `key`. Signals the waiter only for keys not
    /// already in the current window.
    pub fn trigger(&self, key: &str) {
        let mut triggered = self.triggered.lock().unwrap();
        if triggered.insert(key.to_string()) {
            // Capacity-one channel: a pending signal already wakes the
            // waiter, so a full channel needs nothing more from us.
            let _ = self.signal_tx.try_send(());
        }
    }

    /// Blocks until a batching window has closed. Returns true when at
    /// least one trigger arrived, false when nothing happened within the
    /// quiescent timeout. The triggered-key set is cleared on return.
    ///
    /// Single-consumer: concurrent waiters are a programming error.
    pub async fn wait(&self) -> bool {
        let mut signal_rx = self
            .signal_rx
            .try_lock()
            .expect("Batcher::wait is single-consumer");

        tokio::select! {
            _ = signal_rx.recv() => {}
            _ = sleep(QUIESCENT_TIMEOUT) => {
                self.clear(&mut signal_rx);
                return false;
            }
        }

        let window_closes = sleep(self.max_duration);
        tokio::pin!(window_closes);
        let mut idle_deadline = Instant::now() + self.idle_duration;

        loop {
            tokio::select! {
                _ = signal_rx.recv() => {
                    // A new key arrived; hold the window open a bit longer.
                    idle_deadline = Instant::now() + self.idle_duration;
                }
                _ = tokio::time::sleep_until(idle_deadline) => break,
                _ = &mut window_closes => break,
            }
        }

        self.clear(&mut signal_rx);
        true
    }

    fn clear(&self, signal_rx: &mut mpsc::Receiver<()>) {
        let mut triggered = self.triggered.lock().unwrap();
        triggered.clear();
        // Drop any signal raced in after the last recv so the next window
        // does not open spuriously.
        while signal_rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::advance;

    fn batcher(idle_secs: u64, max_secs: u64) -> Arc<Batcher> {
        Arc::new(Batcher::new(
            Duration::from_secs(idle_secs),
            Duration::from_secs(max_secs),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_false_when_quiet() {
        let batcher = batcher(5, 10);
        let started = Instant::now();
        assert!(!batcher.wait().await);
        assert_eq!(started.elapsed(), QUIESCENT_TIMEOUT);
    }

    /// Spawns a waiter and lets it run up to its timers before the test
    /// starts moving the paused clock.
    async fn spawn_waiter(batcher: &Arc<Batcher>) -> tokio::task::JoinHandle<(bool, Duration)> {
        let handle = {
            let batcher = Arc::clone(batcher);
            tokio::spawn(async move {
                let started = Instant::now();
                let triggered = batcher.wait().await;
                (triggered, started.elapsed())
            })
        };
        tokio::task::yield_now().await;
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_does_not_extend_window() {
        let batcher = batcher(5, 10);
        batcher.trigger("pod-1");
        let waiter = spawn_waiter(&batcher).await;

        advance(Duration::from_secs(3)).await;
        batcher.trigger("pod-1");

        let (triggered, elapsed) = waiter.await.unwrap();
        assert!(triggered);
        // Idle timer still expires five seconds after the first trigger.
        assert_eq!(elapsed, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_key_extends_window() {
        let batcher = batcher(5, 10);
        batcher.trigger("pod-1");
        let waiter = spawn_waiter(&batcher).await;

        advance(Duration::from_secs(3)).await;
        batcher.trigger("pod-2");

        let (triggered, elapsed) = waiter.await.unwrap();
        assert!(triggered);
        // Re-armed at t=3, so the window closes at t=8.
        assert_eq!(elapsed, Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_caps_the_window() {
        let batcher = batcher(5, 10);
        batcher.trigger("pod-0");
        let waiter = spawn_waiter(&batcher).await;

        // A fresh key every 3 seconds would extend the idle deadline
        // forever; the max-duration ceiling still closes the window.
        for i in 1..=3 {
            advance(Duration::from_secs(3)).await;
            batcher.trigger(&format!("pod-{}", i));
            tokio::task::yield_now().await;
        }

        let (triggered, elapsed) = waiter.await.unwrap();
        assert!(triggered);
        assert_eq!(elapsed, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_set_clears_between_windows() {
        let batcher = batcher(1, 10);
        batcher.trigger("pod-1");
        assert!(batcher.wait().await);

        // The same key is new again in the next window.
        batcher.trigger("pod-1");
        assert!(batcher.wait().await);
    }
}
