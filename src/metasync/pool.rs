// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fixed worker pool over a bounded queue with caller-runs backpressure.
//!
//! When the queue is full the submitting task runs the work itself, so a
//! fast producer is slowed to the pool's pace instead of growing the queue.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// How a submitted task was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    /// Queue was full (or closed); the caller ran it.
    RanInline,
}

#[derive(Default)]
struct Tracker {
    outstanding: AtomicUsize,
    completed: AtomicU64,
    inline: AtomicU64,
    panicked: AtomicU64,
    idle: Notify,
}

impl Tracker {
    /// Run one task to completion; a panic is counted, not propagated.
    async fn run(&self, task: Task) {
        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            self.panicked.fetch_add(1, Ordering::Relaxed);
            error!("Pool task panicked");
        }
        self.finish();
    }

    fn finish(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct WorkerPool {
    tx: Option<mpsc::Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    tracker: Arc<Tracker>,
}

impl WorkerPool {
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Task>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let tracker = Arc::new(Tracker::default());

        let workers = (0..workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(task) = next else { break };
                        tracker.run(task).await;
                    }
                    debug!(worker = id, "Worker exiting");
                })
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
            tracker,
        }
    }

    pub async fn submit<F>(&self, task: F) -> Submitted
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.outstanding.fetch_add(1, Ordering::AcqRel);
        let task: Task = Box::pin(task);
        let rejected = match &self.tx {
            Some(tx) => match tx.try_send(task) {
                Ok(()) => return Submitted::Queued,
                Err(mpsc::error::TrySendError::Full(task)) => task,
                Err(mpsc::error::TrySendError::Closed(task)) => task,
            },
            None => task,
        };
        self.tracker.inline.fetch_add(1, Ordering::Relaxed);
        self.tracker.run(rejected).await;
        Submitted::RanInline
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.tracker.outstanding.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.tracker.completed.load(Ordering::Relaxed)
    }

    /// Tasks that panicked, on a worker or inline.
    #[must_use]
    pub fn panicked(&self) -> u64 {
        self.tracker.panicked.load(Ordering::Relaxed)
    }

    /// Tasks the caller had to run itself.
    #[must_use]
    pub fn ran_inline(&self) -> u64 {
        self.tracker.inline.load(Ordering::Relaxed)
    }

    /// Wait until every submitted task has settled, calling `progress` each
    /// `period` while still waiting.
    pub async fn wait_idle<P>(&self, period: Duration, mut progress: P)
    where
        P: FnMut(usize),
    {
        loop {
            let notified = self.tracker.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outstanding = self.outstanding();
            if outstanding == 0 {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(period) => progress(self.outstanding()),
            }
        }
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn shutdown(mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}
