//! Background reprocessing pipeline.
//!
//! Deployment changes and the periodic fleet pass become [`Task`]s on a bounded
//! queue drained by a single worker. Policy changes are collected and, after a
//! short [`DropThrottle`] window, re-evaluated across the fleet in one pass.
//!
//! Producers wait for queue space rather than dropping work. [`Reprocessor::stop`]
//! runs any pending policy changes at once, stops the timer, closes the queue and
//! waits for the worker to drain it.

mod task;
mod throttle;
mod worker;

pub use task::Task;
pub use throttle::DropThrottle;
pub use worker::TaskWorker;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use stackwatch_core::{DetectionConfig, ResourceAction};

use crate::error::{DetectionError, Result};

pub struct Reprocessor {
    worker: Arc<TaskWorker>,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    receiver: Mutex<Option<mpsc::Receiver<Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    throttle: DropThrottle,
    pending: Arc<Mutex<BTreeSet<String>>>,
    interval: Duration,
}

impl Reprocessor {
    /// Build the pipeline. Nothing runs until [`start`](Self::start).
    pub fn new(worker: TaskWorker, config: &DetectionConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            worker: Arc::new(worker),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            handles: Mutex::new(Vec::new()),
            shutdown,
            throttle: DropThrottle::new(config.policy_throttle),
            pending: Arc::new(Mutex::new(BTreeSet::new())),
            // tokio intervals reject a zero period.
            interval: config.reprocess_interval.max(Duration::from_secs(1)),
        }
    }

    pub fn worker(&self) -> &Arc<TaskWorker> {
        &self.worker
    }

    /// Spawn the worker and the periodic timer. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        let Some(rx) = self.receiver.lock().expect("receiver lock poisoned").take() else {
            debug!("reprocessor already started");
            return Ok(());
        };
        let tx = self.sender()?;

        let mut handles = self.handles.lock().expect("handles lock poisoned");
        handles.push(tokio::spawn(self.worker.clone().run(rx)));
        handles.push(tokio::spawn(run_timer(
            self.worker.clone(),
            tx,
            self.interval,
            self.shutdown.subscribe(),
        )));
        info!(interval = ?self.interval, throttle = ?self.throttle.window(), "reprocessor started");
        Ok(())
    }

    /// Queue a task, waiting for space if the queue is full.
    pub async fn enqueue(&self, task: Task) -> Result<()> {
        let tx = self.sender()?;
        tx.send(task).await.map_err(|_| DetectionError::QueueClosed)
    }

    /// Note that `policy_id` changed. Changes arriving within one throttle
    /// window are re-evaluated together.
    pub fn policy_changed(&self, policy_id: &str) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(policy_id.to_string());

        let worker = self.worker.clone();
        let pending = self.pending.clone();
        self.throttle.run(move || async move {
            let ids = std::mem::take(&mut *pending.lock().expect("pending lock poisoned"));
            for policy_id in ids {
                match worker.reprocess_policy(&policy_id).await {
                    Ok(diff) => debug!(
                        policy_id = %policy_id,
                        new = diff.new.len(),
                        updated = diff.updated.len(),
                        stale = diff.stale.len(),
                        "policy reprocessed"
                    ),
                    Err(e) => warn!(policy_id = %policy_id, error = %e, "policy reprocessing failed"),
                }
            }
        });
    }

    /// Flush pending policy changes, stop the timer, close the queue and wait
    /// for queued tasks to finish.
    pub async fn stop(&self) {
        self.throttle.flush().await;
        let _ = self.shutdown.send(true);
        self.sender.lock().expect("sender lock poisoned").take();
        // Never started: nothing will drain the queue.
        self.receiver.lock().expect("receiver lock poisoned").take();

        let handles = std::mem::take(&mut *self.handles.lock().expect("handles lock poisoned"));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "reprocessing task panicked");
            }
        }
        info!("reprocessor stopped");
    }

    fn sender(&self) -> Result<mpsc::Sender<Task>> {
        self.sender
            .lock()
            .expect("sender lock poisoned")
            .clone()
            .ok_or(DetectionError::QueueClosed)
    }
}

/// Ticker for the periodic fleet pass. A pass that overruns its period pushes
/// the next one back instead of triggering a catch-up burst.
fn fleet_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Queue every known deployment once per `interval` until shutdown.
async fn run_timer(
    worker: Arc<TaskWorker>,
    tx: mpsc::Sender<Task>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = fleet_ticker(interval);
    // First tick completes immediately; the fleet was just evaluated on startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let deployments = match worker.entities().get_deployments().await {
            Ok(deployments) => deployments,
            Err(e) => {
                warn!(error = %e, "failed to list deployments for periodic reprocessing");
                continue;
            }
        };
        info!(deployments = deployments.len(), "periodic reprocessing");
        for deployment in deployments {
            let task = Task::new(deployment.id, ResourceAction::Update);
            tokio::select! {
                sent = tx.send(task) => {
                    if sent.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}
