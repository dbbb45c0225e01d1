//! Execution substrate for batch work
//!
//! `submit` hands a unit of work to one of three interchangeable backends
//! selected at construction: an inline call, a bounded worker pool, or a
//! FIFO queue drained by a fixed set of consumers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tracing::debug;

use crate::config::ExecutionMode;

pub type WorkUnit = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type QueuedWork = (WorkUnit, oneshot::Sender<()>);

/// Completion handle of a submitted unit
pub struct WorkHandle {
    done: oneshot::Receiver<()>,
}

impl WorkHandle {
    fn finished() -> Self {
        let (tx, done) = oneshot::channel();
        let _ = tx.send(());
        Self { done }
    }

    /// Wait until the unit has run (or was dropped by a stopped backend)
    pub async fn wait(self) {
        let _ = self.done.await;
    }
}

pub enum Executor {
    /// Runs the unit to completion inside `submit`
    Inline,
    /// Spawns each unit; at most `workers` run at once
    Worker { permits: Arc<Semaphore> },
    /// Enqueues the unit; consumers run units in submission order
    Queue { tx: mpsc::UnboundedSender<QueuedWork> },
}

impl Executor {
    /// Must be called inside a Tokio runtime for the worker and queue backends
    pub fn new(mode: ExecutionMode, workers: usize) -> Self {
        let workers = workers.max(1);
        match mode {
            ExecutionMode::Inline => Executor::Inline,
            ExecutionMode::Worker => Executor::Worker {
                permits: Arc::new(Semaphore::new(workers)),
            },
            ExecutionMode::Queue => {
                let (tx, rx) = mpsc::unbounded_channel::<QueuedWork>();
                let rx = Arc::new(Mutex::new(rx));
                for consumer in 0..workers {
                    let rx = rx.clone();
                    tokio::spawn(async move {
                        loop {
                            let next = rx.lock().await.recv().await;
                            let Some((unit, done)) = next else {
                                break;
                            };
                            unit.await;
                            let _ = done.send(());
                        }
                        debug!(consumer, "Queue consumer stopped");
                    });
                }
                Executor::Queue { tx }
            }
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        match self {
            Executor::Inline => ExecutionMode::Inline,
            Executor::Worker { .. } => ExecutionMode::Worker,
            Executor::Queue { .. } => ExecutionMode::Queue,
        }
    }

    pub async fn submit(&self, unit: WorkUnit) -> WorkHandle {
        match self {
            Executor::Inline => {
                unit.await;
                WorkHandle::finished()
            }
            Executor::Worker { permits } => {
                let permits = permits.clone();
                let (tx, done) = oneshot::channel();
                tokio::spawn(async move {
                    // A closed semaphore still lets the unit run
                    let _permit = permits.acquire_owned().await.ok();
                    unit.await;
                    let _ = tx.send(());
                });
                WorkHandle { done }
            }
            Executor::Queue { tx } => {
                let (done_tx, done) = oneshot::channel();
                if tx.send((unit, done_tx)).is_err() {
                    tracing::error!("Work queue closed; unit dropped");
                }
                WorkHandle { done }
            }
        }
    }
}
