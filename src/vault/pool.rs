//! Bounded worker pool for ingestion tasks.
//!
//! Tasks go into a shared queue; workers pull one at a time and send
//! `(task, result)` back as they finish, so results arrive in completion
//! order, not submission order. Cancelling stops workers from taking new
//! tasks; tasks already running finish normally.

use crossbeam_channel::{Receiver, unbounded};
use log::warn;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

pub struct WorkerPool {
    workers: usize,
    name: String,
}

impl WorkerPool {
    pub fn new(name: &str, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            name: name.to_string(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn run<T, R, F>(&self, tasks: Vec<T>, work: F) -> TaskBatch<T, R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(&T) -> R + Send + Sync + 'static,
    {
        let submitted = tasks.len();
        let (task_tx, task_rx) = unbounded();
        for task in tasks {
            // receiver is alive in this scope, send cannot fail
            let _ = task_tx.send(task);
        }
        drop(task_tx);

        let (result_tx, result_rx) = unbounded();
        let cancel = Arc::new(AtomicBool::new(false));
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(self.workers);
        for idx in 0..self.workers.min(submitted.max(1)) {
            let task_rx: Receiver<T> = task_rx.clone();
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            let work = work.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{idx}", self.name))
                .spawn(move || {
                    while !cancel.load(Ordering::Acquire) {
                        let Ok(task) = task_rx.recv() else {
                            break;
                        };
                        let out = work(&task);
                        if result_tx.send((task, out)).is_err() {
                            break;
                        }
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!("failed to spawn {} worker {idx}: {err}", self.name),
            }
        }
        drop(result_tx);

        TaskBatch {
            results: result_rx,
            queue: task_rx,
            handles,
            cancel,
            submitted,
        }
    }
}

/// Results of one `WorkerPool::run`. Dropping it cancels whatever has not
/// started and waits for running tasks.
pub struct TaskBatch<T, R> {
    results: Receiver<(T, R)>,
    queue: Receiver<T>,
    handles: Vec<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
    submitted: usize,
}

impl<T, R> TaskBatch<T, R> {
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Stop handing out queued tasks.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Tasks still sitting in the queue.
    pub fn unstarted(&self) -> usize {
        self.queue.len()
    }

    /// Cancel, wait for in-flight tasks, and return the results they produced.
    pub fn cancel_and_drain(mut self) -> Vec<(T, R)> {
        self.cancel();
        self.join_workers();
        self.results.try_iter().collect()
    }

    fn join_workers(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl<T, R> Iterator for TaskBatch<T, R> {
    type Item = (T, R);

    fn next(&mut self) -> Option<Self::Item> {
        self.results.recv().ok()
    }
}

impl<T, R> Drop for TaskBatch<T, R> {
    fn drop(&mut self) {
        self.cancel();
        self.join_workers();
    }
}
