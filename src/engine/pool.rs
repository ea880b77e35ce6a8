//! Apply worker pool
//!
//! A fixed number of workers pull approved job ids from one FIFO queue, so
//! at most `workers` applies run at once and the rest wait in approval order.
//! Shutdown stops admission and lets running applies finish; ids still in
//! the queue stay approved in the job store and are requeued on restart.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::orchestrator::run_apply;
use super::{EngineContext, EngineError, EngineResult};
use crate::observability::Logger;

type Queue = Arc<AsyncMutex<mpsc::UnboundedReceiver<Uuid>>>;

pub struct ApplyPool {
    sender: Mutex<Option<mpsc::UnboundedSender<Uuid>>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
}

impl ApplyPool {
    /// Spawn `workers` apply workers. Must be called inside a tokio runtime.
    pub fn start(ctx: EngineContext, workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let queue: Queue = Arc::new(AsyncMutex::new(receiver));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let waiting = Arc::new(AtomicUsize::new(0));

        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    ctx.clone(),
                    queue.clone(),
                    shutdown.subscribe(),
                    in_flight.clone(),
                    waiting.clone(),
                ))
            })
            .collect();

        Logger::info("APPLY_POOL_STARTED", &[("workers", &workers.max(1).to_string())]);

        Self {
            sender: Mutex::new(Some(sender)),
            shutdown,
            workers: Mutex::new(handles),
            in_flight,
            waiting,
        }
    }

    /// Queue an approved job behind earlier submissions.
    pub fn submit(&self, job_id: Uuid) -> EngineResult<()> {
        let guard = self.sender.lock().map_err(|_| EngineError::PoolClosed)?;
        let sender = guard.as_ref().ok_or(EngineError::PoolClosed)?;
        self.waiting.fetch_add(1, Ordering::SeqCst);
        if sender.send(job_id).is_err() {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::PoolClosed);
        }
        Logger::info("APPLY_QUEUED", &[("job_id", &job_id.to_string())]);
        Ok(())
    }

    /// False once shutdown has begun.
    pub fn is_accepting(&self) -> bool {
        self.sender.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Applies currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Submitted applies not yet picked up by a worker.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Stop admission and wait for running applies to finish.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let _ = self.shutdown.send(true);

        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        Logger::info(
            "APPLY_POOL_STOPPED",
            &[("left_queued", &self.waiting().to_string())],
        );
    }
}

async fn worker_loop(
    worker: usize,
    ctx: EngineContext,
    queue: Queue,
    mut shutdown: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            id = async { queue.lock().await.recv().await } => id,
        };
        let Some(job_id) = next else {
            break;
        };

        waiting.fetch_sub(1, Ordering::SeqCst);
        in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = run_apply(&ctx, job_id).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Err(e) = outcome {
            Logger::error(
                "APPLY_FAILED",
                &[
                    ("code", e.code()),
                    ("error", &e.to_string()),
                    ("job_id", &job_id.to_string()),
                    ("worker", &worker.to_string()),
                ],
            );
        }
    }
}
