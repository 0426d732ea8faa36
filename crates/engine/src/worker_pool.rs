//! Fixed set of delivery workers behind a bounded job queue.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{Notification, SendResponse};

use crate::channel::ChannelDispatcher;

/// Result of delivering one notification. `notification` carries the
/// accumulated `retry_count`.
pub struct DeliveryOutcome {
    pub notification: Notification,
    pub result: AppResult<SendResponse>,
}

struct Job {
    notification: Notification,
    cancel: CancellationToken,
    reply: oneshot::Sender<DeliveryOutcome>,
}

pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
}

impl WorkerPool {
    /// Spawn `workers` tasks sharing one queue of `queue_capacity` jobs. Must be
    /// called from within a tokio runtime. Workers stop once the pool is
    /// dropped and the queue drains.
    pub fn new(dispatcher: Arc<ChannelDispatcher>, workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            tokio::spawn(worker_loop(worker, rx.clone(), dispatcher.clone()));
        }

        Self { jobs: tx }
    }

    /// Queue a notification, waiting for space if the queue is full.
    pub async fn submit(
        &self,
        notification: Notification,
        cancel: CancellationToken,
    ) -> AppResult<oneshot::Receiver<DeliveryOutcome>> {
        let (reply, outcome) = oneshot::channel();
        self.jobs
            .send(Job {
                notification,
                cancel,
                reply,
            })
            .await
            .map_err(|_| AppError::Internal("sender workers have stopped".to_string()))?;
        Ok(outcome)
    }
}

async fn worker_loop(
    worker: usize,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    dispatcher: Arc<ChannelDispatcher>,
) {
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(Job {
            mut notification,
            cancel,
            reply,
        }) = job
        else {
            break;
        };

        let result = dispatcher.send(&mut notification, &cancel).await;
        // The submitter may have given up on the reply.
        let _ = reply.send(DeliveryOutcome {
            notification,
            result,
        });
    }

    tracing::debug!(worker, "Sender worker stopped");
}
