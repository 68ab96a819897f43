use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Trailing-edge debouncer. Each trigger cancels the pending timer and starts
/// a new one; the action runs once the delay passes without another trigger.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn trigger<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            // Detached so a later trigger cannot abort an action already running.
            tokio::spawn(action());
        });

        if let Ok(mut pending) = self.pending.lock() {
            if let Some(previous) = pending.replace(timer) {
                previous.abort();
            }
        }
    }

    pub fn cancel(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(previous) = pending.take() {
                previous.abort();
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .map(|p| p.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_run() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let fired: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        for i in 0..2 {
            if i > 0 {
                sleep(Duration::from_millis(50)).await;
            }
            let fired = fired.clone();
            debouncer.trigger(move || async move {
                fired.lock().unwrap().push(Instant::now());
            });
        }
        assert!(debouncer.is_pending());

        sleep(Duration::from_secs(2)).await;
        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0] - start, Duration::from_millis(550));
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_separated_triggers_each_run() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let count = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let count = count.clone();
            debouncer.trigger(move || async move {
                *count.lock().unwrap() += 1;
            });
            sleep(Duration::from_millis(150)).await;
        }
        assert_eq!(*count.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_run() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        debouncer.trigger(move || async move {
            *counter.lock().unwrap() += 1;
        });
        debouncer.cancel();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(*count.lock().unwrap(), 0);
    }
}
