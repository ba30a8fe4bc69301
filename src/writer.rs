use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::Task;
use crate::store::Store;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

enum Message {
    Write(Box<Task>),
    Flush(oneshot::Sender<()>),
}

/// Single-consumer worker that owns all `tasks.json` writes for its store.
/// Producers enqueue tasks; the worker applies them one at a time, so two
/// generation jobs can never interleave a read-modify-write on the same
/// file. A full queue fails fast instead of blocking the producer.
pub struct WriteWorker {
    tx: mpsc::Sender<Message>,
    handle: Option<JoinHandle<()>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl WriteWorker {
    /// Spawn the worker with the default queue capacity.
    pub fn start(store: Arc<Store>) -> Self {
        Self::start_with_capacity(store, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn start_with_capacity(store: Arc<Store>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(capacity);
        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let worker_errors = Arc::clone(&errors);

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Write(task) => {
                        if let Err(e) = persist_task(&store, &task) {
                            warn!(task_id = %task.id, error = %e, "task write failed");
                            worker_errors
                                .lock()
                                .expect("errors lock")
                                .push(e.to_string());
                        }
                    }
                    Message::Flush(done) => {
                        // All writes enqueued before this flush are applied.
                        let _ = done.send(());
                    }
                }
            }
            debug!("write worker drained and stopped");
        });

        Self {
            tx,
            handle: Some(handle),
            errors,
        }
    }

    /// Enqueue one task. Fails fast when the queue is full or the worker
    /// is stopped.
    pub fn queue_task(&self, task: Task) -> Result<()> {
        self.tx
            .try_send(Message::Write(Box::new(task)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::Store("write queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::Store("write worker is stopped".to_string())
                }
            })
    }

    pub fn queue_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        for task in tasks {
            self.queue_task(task)?;
        }
        Ok(())
    }

    /// Wait until everything enqueued so far has been written.
    pub async fn wait_for_completion(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Message::Flush(done_tx))
            .await
            .map_err(|_| Error::Store("write worker is stopped".to_string()))?;
        done_rx
            .await
            .map_err(|_| Error::Store("write worker dropped flush".to_string()))
    }

    /// Errors collected so far, oldest first.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("errors lock").clone()
    }

    /// Stop the worker, draining everything already queued, and return the
    /// collected errors.
    pub async fn stop(mut self) -> Vec<String> {
        drop(self.tx);
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "write worker join failed");
        }
        self.errors.lock().expect("errors lock").clone()
    }
}

/// Replace-by-id-else-append into `PR-<n>/tasks.json`.
fn persist_task(store: &Store, task: &Task) -> Result<()> {
    let mut tasks = store.tasks_by_pr(task.pr)?;
    match tasks.iter_mut().find(|t| t.id == task.id) {
        Some(existing) => {
            *existing = task.clone();
            existing.updated_at = Utc::now();
        }
        None => tasks.push(task.clone()),
    }
    store.save_tasks(task.pr, tasks)
}
