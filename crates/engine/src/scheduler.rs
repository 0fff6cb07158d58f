// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The worker pool driving node and graph-output tasks.
//!
//! A deliberately small scheduler: a shared FIFO of [`Task`]s served by a
//! fixed set of worker threads. Fairness and per-node ordering come from the
//! nodes themselves (one queued task per node at a time), so the pool only
//! needs run-to-completion semantics and an idle signal.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use tracing::trace;

/// A unit of work: run one node's pending invocations, or drain one graph
/// output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Node(usize),
    GraphOutput(usize),
}

/// Executes a task. Supplied by the graph driver.
pub type TaskRunner = Arc<dyn Fn(Task) + Send + Sync>;

struct Inner {
    queue: VecDeque<Task>,
    running: usize,
    shutdown: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    work_cv: Condvar,
    idle_cv: Condvar,
}

/// Fixed-size worker pool with an idle condition.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner { queue: VecDeque::new(), running: 0, shutdown: false }),
                work_cv: Condvar::new(),
                idle_cv: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker threads. Called once per run; a scheduler that was
    /// shut down can be started again.
    pub fn start(&self, num_threads: usize, runner: TaskRunner) {
        let num_threads = num_threads.max(1);
        self.shared.inner.lock().shutdown = false;
        let mut workers = self.workers.lock();
        for i in 0..num_threads {
            let shared = Arc::clone(&self.shared);
            let runner = Arc::clone(&runner);
            let handle = thread::Builder::new()
                .name(format!("flowgraph-worker-{i}"))
                .spawn(move || worker_loop(&shared, &runner))
                .unwrap_or_else(|e| panic!("failed to spawn worker thread: {e}"));
            workers.push(handle);
        }
    }

    /// Enqueues a task.
    pub fn submit(&self, task: Task) {
        let mut inner = self.shared.inner.lock();
        if inner.shutdown {
            return;
        }
        trace!(?task, "submit");
        inner.queue.push_back(task);
        drop(inner);
        self.shared.work_cv.notify_one();
    }

    /// Blocks until no task is queued or running.
    pub fn wait_until_idle(&self) {
        let mut inner = self.shared.inner.lock();
        while !inner.queue.is_empty() || inner.running > 0 {
            self.shared.idle_cv.wait(&mut inner);
        }
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.queue.is_empty() && inner.running == 0
    }

    /// Stops the workers after the queue drains and joins them. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.shutdown = true;
        }
        self.shared.work_cv.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared, runner: &TaskRunner) {
    loop {
        let task = {
            let mut inner = shared.inner.lock();
            loop {
                if let Some(task) = inner.queue.pop_front() {
                    inner.running += 1;
                    break task;
                }
                if inner.shutdown {
                    return;
                }
                shared.work_cv.wait(&mut inner);
            }
        };
        runner(task);
        let mut inner = shared.inner.lock();
        inner.running -= 1;
        if inner.queue.is_empty() && inner.running == 0 {
            shared.idle_cv.notify_all();
        }
    }
}
