use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Collapses bursts of triggers into one delayed run.
///
/// The first trigger arms the throttle and schedules its job after `window`;
/// triggers arriving while it is armed are dropped. The throttle disarms just
/// before the job starts, so a trigger during the job schedules a new run.
///
/// Scheduled runs are tracked; [`flush`](Self::flush) cuts the wait short and
/// waits for every run to finish.
#[derive(Debug)]
pub struct DropThrottle {
    window: Duration,
    armed: Arc<AtomicBool>,
    flush: watch::Sender<bool>,
    runs: Mutex<Vec<JoinHandle<()>>>,
}

impl DropThrottle {
    pub fn new(window: Duration) -> Self {
        let (flush, _) = watch::channel(false);
        Self {
            window,
            armed: Arc::new(AtomicBool::new(false)),
            flush,
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Schedule `job` unless a run is already pending. Returns whether this
    /// trigger armed the throttle. Must be called inside a tokio runtime.
    ///
    /// After [`flush`](Self::flush) a new job runs without waiting.
    pub fn run<F, Fut>(&self, job: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.armed.swap(true, Ordering::SeqCst) {
            debug!(window = ?self.window, "throttle armed, dropping trigger");
            return false;
        }
        let armed = self.armed.clone();
        let window = self.window;
        let mut flushed = self.flush.subscribe();
        let handle = tokio::spawn(async move {
            if !*flushed.borrow_and_update() {
                tokio::select! {
                    _ = tokio::time::sleep(window) => {}
                    _ = flushed.changed() => {}
                }
            }
            armed.store(false, Ordering::SeqCst);
            job().await;
        });

        let mut runs = self.runs.lock().expect("runs lock poisoned");
        runs.retain(|run| !run.is_finished());
        runs.push(handle);
        true
    }

    /// Run any pending job now and wait for all scheduled runs to complete.
    pub async fn flush(&self) {
        self.flush.send_replace(true);
        let runs = std::mem::take(&mut *self.runs.lock().expect("runs lock poisoned"));
        for run in runs {
            if let Err(e) = run.await {
                warn!(error = %e, "throttled job panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn burst_collapses_into_one_run() {
        let throttle = DropThrottle::new(Duration::from_millis(30));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut armed = Vec::new();
        for _ in 0..5 {
            let runs = runs.clone();
            armed.push(throttle.run(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(armed, vec![true, false, false, false, false]);
        assert!(throttle.is_armed());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!throttle.is_armed());

        let again = runs.clone();
        assert!(throttle.run(move || async move {
            again.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn flush_runs_the_pending_job_and_waits_for_it() {
        let throttle = DropThrottle::new(Duration::from_secs(3600));
        let runs = Arc::new(AtomicUsize::new(0));

        let pending = runs.clone();
        assert!(throttle.run(move || async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pending.fetch_add(1, Ordering::SeqCst);
        }));
        throttle.flush().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!throttle.is_armed());

        // Once flushed, new triggers no longer wait out the window.
        let late = runs.clone();
        assert!(throttle.run(move || async move {
            late.fetch_add(1, Ordering::SeqCst);
        }));
        throttle.flush().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
