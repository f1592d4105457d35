//! Cancellable background workers.
//!
//! A [`Worker`] owns one tokio task that calls [`WorkUnit::do_work`] in a loop
//! until it is told to stop. Every blocking wait inside a work unit selects on
//! the [`Shutdown`] handle so that [`Worker::stop_work`] returns promptly.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause between iterations after a failed work unit.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Returned by blocking waits when the shutdown signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interrupted by shutdown")]
pub struct Interrupted;

/// Fires the shutdown signal of one worker run.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Signal every [`Shutdown`] handle created from this trigger.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Create a connected trigger/handle pair.
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx })
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires (or the trigger is dropped).
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // A dropped trigger counts as a shutdown.
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration` unless shutdown fires first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        tokio::select! {
            _ = self.triggered() => Err(Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// What the worker loop should do after a successful iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Continue,
    Terminate,
}

/// Errors surfaced by a work unit.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// A blocking wait was cut short by shutdown; ends the loop cleanly.
    #[error("interrupted by shutdown")]
    Interrupted,

    /// Any other failure; logged and the loop continues.
    #[error(transparent)]
    Failed(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<Interrupted> for WorkError {
    fn from(_: Interrupted) -> Self {
        WorkError::Interrupted
    }
}

/// One pipeline stage's unit of work.
///
/// Units are cloned into the task on every start, so they should hold only
/// shared handles; state that must survive a restart lives behind them.
#[async_trait]
pub trait WorkUnit: Clone + Send + Sync + 'static {
    /// Name used in log fields.
    fn name(&self) -> &'static str;

    async fn do_work(&mut self, shutdown: &Shutdown) -> Result<WorkOutcome, WorkError>;
}

/// How a [`Worker::stop_work`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The task observed the signal and exited.
    Stopped,
    /// There was no task to stop.
    NotRunning,
    /// The grace period elapsed and the task was aborted.
    Aborted,
}

struct Running {
    trigger: ShutdownTrigger,
    handle: JoinHandle<()>,
}

/// A restartable background loop around a [`WorkUnit`].
pub struct Worker<W: WorkUnit> {
    unit: W,
    running: Option<Running>,
}

impl<W: WorkUnit> Worker<W> {
    pub fn new(unit: W) -> Self {
        Self {
            unit,
            running: None,
        }
    }

    /// Spawn the loop. A no-op when the loop is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_work(&mut self) -> bool {
        if self.is_running() {
            debug!(worker = self.unit.name(), "Worker already running");
            return false;
        }

        let (trigger, shutdown) = Shutdown::channel();
        let handle = tokio::spawn(run_loop(self.unit.clone(), shutdown));
        self.running = Some(Running { trigger, handle });
        true
    }

    /// Whether the loop task is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    /// Signal shutdown and wait up to `grace` for the loop to exit.
    pub async fn stop_work(&mut self, grace: Duration) -> StopOutcome {
        let Some(mut running) = self.running.take() else {
            return StopOutcome::NotRunning;
        };

        running.trigger.fire();

        match tokio::time::timeout(grace, &mut running.handle).await {
            Ok(Ok(())) => StopOutcome::Stopped,
            Ok(Err(e)) => {
                warn!(worker = self.unit.name(), error = %e, "Worker task ended abnormally");
                StopOutcome::Stopped
            }
            Err(_) => {
                warn!(
                    worker = self.unit.name(),
                    grace_ms = grace.as_millis() as u64,
                    "Worker did not stop in time, aborting"
                );
                running.handle.abort();
                StopOutcome::Aborted
            }
        }
    }
}

impl<W: WorkUnit> Drop for Worker<W> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.trigger.fire();
        }
    }
}

async fn run_loop<W: WorkUnit>(mut unit: W, shutdown: Shutdown) {
    let name = unit.name();
    info!(worker = name, "Worker started");

    while !shutdown.is_triggered() {
        let iteration = AssertUnwindSafe(unit.do_work(&shutdown)).catch_unwind().await;

        match iteration {
            Ok(Ok(WorkOutcome::Continue)) => {}
            Ok(Ok(WorkOutcome::Terminate)) => {
                info!(worker = name, "Worker terminated itself");
                break;
            }
            Ok(Err(WorkError::Interrupted)) => break,
            Ok(Err(WorkError::Failed(e))) => {
                warn!(worker = name, error = %e, "Work iteration failed");
                if shutdown.sleep(ERROR_BACKOFF).await.is_err() {
                    break;
                }
            }
            Err(_) => {
                error!(worker = name, "Work iteration panicked");
                if shutdown.sleep(ERROR_BACKOFF).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(worker = name, "Worker stopped");
}
