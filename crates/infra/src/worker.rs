//! Background task plumbing shared by the consumer runtime and the periodic sweeps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(name: impl Into<String>, shutdown: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(worker = %self.name, error = %err, "worker ended abnormally");
            }
        }
    }
}

/// Work that runs on a fixed interval (session timeouts, stuck saga sweep).
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    /// One pass. Failures are logged by the runner and the next tick proceeds.
    async fn run_once(&self) -> Result<(), atlas_core::CoreError>;
}

/// Run `task` every `task.interval()` until `shutdown` flips to `true`.
pub fn spawn_periodic<T: PeriodicTask>(task: Arc<T>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(task.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = task.run_once().await {
                        warn!(task = task.name(), error = %err, "periodic task failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(task = task.name(), "periodic task stopped");
    })
}

/// [`spawn_periodic`] with its own shutdown channel.
pub fn spawn_periodic_worker<T: PeriodicTask>(task: Arc<T>) -> WorkerHandle {
    let (tx, rx) = watch::channel(false);
    let name = task.name().to_string();
    let join = spawn_periodic(task, rx);
    WorkerHandle::new(name, tx, join)
}
