use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use tokio::sync::mpsc;

/// A unit of work for the [`WorkQueue`], identified by a caller-chosen key.
pub struct Task<T> {
    key: String,
    fut: BoxFuture<'static, anyhow::Result<T>>,
}

impl<T> Task<T> {
    pub fn new<F>(key: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Task {
            key: key.into(),
            fut: fut.boxed(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("key", &self.key).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueProgress {
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
    pub total: usize,
}

/// Reported to the run callback after every finished task.
pub enum QueueEvent<'a, T> {
    Completed {
        key: &'a str,
        result: &'a T,
        progress: QueueProgress,
    },
    Failed {
        key: &'a str,
        error: &'a anyhow::Error,
        progress: QueueProgress,
    },
}

#[derive(Debug)]
pub struct FailedTask {
    pub key: String,
    pub error: anyhow::Error,
}

#[derive(Debug)]
pub struct QueueOutcome<T> {
    pub completed: Vec<T>,
    pub failed: Vec<FailedTask>,
}

/// Cloneable handle used to add tasks to a queue, including while it runs.
pub struct QueueHandle<T> {
    tx: mpsc::UnboundedSender<Task<T>>,
    total: Arc<AtomicUsize>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        QueueHandle {
            tx: self.tx.clone(),
            total: self.total.clone(),
        }
    }
}

impl<T> QueueHandle<T> {
    pub fn add(&self, tasks: impl IntoIterator<Item = Task<T>>) {
        for task in tasks {
            // total is raised before the task becomes visible so completion can't be seen early
            self.total.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.tx.send(task) {
                self.total.fetch_sub(1, Ordering::SeqCst);
                warn!("queue already finished, dropping task {}", e.0.key());
            }
        }
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Bounded-concurrency task runner whose task list may grow while it runs.
///
/// At most `concurrency` tasks are in flight at any instant. Failed tasks are
/// not retried here; callers resubmit through the [`QueueHandle`] passed to the
/// run callback when they want a retry.
pub struct WorkQueue<T> {
    concurrency: usize,
    pending: VecDeque<Task<T>>,
    rx: mpsc::UnboundedReceiver<Task<T>>,
    handle: QueueHandle<T>,
    completed: usize,
    failed: usize,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new(tasks: Vec<Task<T>>, concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = QueueHandle {
            tx,
            total: Arc::new(AtomicUsize::new(tasks.len())),
        };
        WorkQueue {
            concurrency: concurrency.max(1),
            pending: tasks.into(),
            rx,
            handle,
            completed: 0,
            failed: 0,
        }
    }

    pub fn handle(&self) -> QueueHandle<T> {
        self.handle.clone()
    }

    pub fn add(&self, tasks: impl IntoIterator<Item = Task<T>>) {
        self.handle.add(tasks)
    }

    /// Drives every task, including ones added along the way, to completion.
    ///
    /// `on_event` is called once per finished task, in completion order, before
    /// the queue refills its free slots. The returned outcome is the single
    /// terminal result of the run.
    pub async fn run<F>(mut self, mut on_event: F) -> QueueOutcome<T>
    where
        F: FnMut(QueueEvent<'_, T>, &QueueHandle<T>),
    {
        let mut results = vec![];
        let mut failures = vec![];
        let mut in_flight: FuturesUnordered<BoxFuture<'static, (String, anyhow::Result<T>)>> =
            FuturesUnordered::new();

        loop {
            self.receive_added();

            while in_flight.len() < self.concurrency {
                let Some(task) = self.pending.pop_front() else {
                    break;
                };
                let Task { key, fut } = task;
                debug!("starting task {}", key);
                in_flight.push(async move { (key, fut.await) }.boxed());
            }

            if in_flight.is_empty() {
                // nothing running and nothing left to start
                let total = self.handle.total();
                if self.completed + self.failed != total {
                    warn!(
                        "queue drained with {} completed and {} failed out of {} tasks",
                        self.completed, self.failed, total
                    );
                }
                break;
            }

            let Some((key, result)) = in_flight.next().await else {
                continue;
            };

            match result {
                Ok(value) => {
                    self.completed += 1;
                    let progress = self.progress(in_flight.len());
                    on_event(
                        QueueEvent::Completed {
                            key: &key,
                            result: &value,
                            progress,
                        },
                        &self.handle,
                    );
                    results.push(value);
                }
                Err(error) => {
                    self.failed += 1;
                    let progress = self.progress(in_flight.len());
                    debug!("task {} failed: {:#}", key, error);
                    on_event(
                        QueueEvent::Failed {
                            key: &key,
                            error: &error,
                            progress,
                        },
                        &self.handle,
                    );
                    failures.push(FailedTask { key, error });
                }
            }
        }

        debug!(
            "queue complete: {} completed, {} failed",
            results.len(),
            failures.len()
        );

        QueueOutcome {
            completed: results,
            failed: failures,
        }
    }

    fn receive_added(&mut self) {
        while let Ok(task) = self.rx.try_recv() {
            self.pending.push_back(task);
        }
    }

    fn progress(&self, running: usize) -> QueueProgress {
        QueueProgress {
            completed: self.completed,
            failed: self.failed,
            running,
            pending: self.pending.len(),
            total: self.handle.total(),
        }
    }
}
