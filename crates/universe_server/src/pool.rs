//! Bounded worker pool with pollable promises.
//!
//! The control loop hands anything slow (world bootstrap, snapshots, client
//! persistence, session flushes) to the pool and polls the returned
//! [`Promise`] on later passes instead of blocking.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::error::{panic_message, PoolError};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PromiseCell<T> {
    result: Mutex<Option<Result<T, PoolError>>>,
    ready: Condvar,
}

impl<T> PromiseCell<T> {
    fn complete(&self, value: Result<T, PoolError>) {
        *self.result.lock() = Some(value);
        self.ready.notify_all();
    }
}

/// Handle to the eventual result of a pool job.
///
/// Promises cannot be cancelled. Dropping one discards the result once the
/// job finishes.
pub struct Promise<T> {
    cell: Arc<PromiseCell<T>>,
}

impl<T> Promise<T> {
    fn pending() -> Self {
        Self {
            cell: Arc::new(PromiseCell {
                result: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// A promise that is already fulfilled.
    pub fn ready(value: Result<T, PoolError>) -> Self {
        let promise = Self::pending();
        promise.cell.complete(value);
        promise
    }

    /// True once the job has finished. Never blocks.
    pub fn poll(&self) -> bool {
        self.cell.result.lock().is_some()
    }

    /// Blocks up to `timeout` for the job to finish.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut result = self.cell.result.lock();
        while result.is_none() {
            if self.cell.ready.wait_until(&mut result, deadline).timed_out() {
                return result.is_some();
            }
        }
        true
    }

    /// Blocks until the job finishes and returns its result.
    pub fn get(self) -> Result<T, PoolError> {
        let mut result = self.cell.result.lock();
        loop {
            if let Some(value) = result.take() {
                return value;
            }
            self.cell.ready.wait(&mut result);
        }
    }
}

/// Fixed set of threads executing submitted closures.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(receiver));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("❌ Failed to spawn {} worker {}: {}", name, index, e),
            }
        }
        info!("🧵 Worker pool '{}' started with {} thread(s)", name, workers.len());

        Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Runs `job` on a pool thread.
    ///
    /// Errors returned by the job become [`PoolError::Failed`], panics become
    /// [`PoolError::Panicked`]. After shutdown the promise fails immediately.
    pub fn submit<T, F>(&self, job: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let promise = Promise::pending();
        let cell = promise.cell.clone();
        let task: Job = Box::new(move || {
            let result = match catch_unwind(AssertUnwindSafe(job)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(PoolError::Failed(format!("{e:#}"))),
                Err(payload) => Err(PoolError::Panicked(panic_message(payload.as_ref()))),
            };
            cell.complete(result);
        });

        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) if sender.send(task).is_ok() => promise,
            _ => Promise::ready(Err(PoolError::ShutDown)),
        }
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the threads.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("❌ Worker pool '{}' thread panicked", self.name);
            }
        }
        debug!("Worker pool '{}' stopped", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_promise_poll_then_get() {
        let pool = WorkerPool::new("test-pool", 2);
        let (release_tx, release_rx) = channel::bounded::<()>(1);
        let promise = pool.submit(move || {
            release_rx.recv()?;
            Ok(42)
        });

        assert!(!promise.poll());
        release_tx.send(()).unwrap();
        assert!(promise.wait_timeout(Duration::from_secs(5)));
        assert!(promise.poll());
        assert_eq!(promise.get().unwrap(), 42);
    }

    #[test]
    fn test_errors_and_panics_become_pool_errors() {
        let pool = WorkerPool::new("test-pool", 1);
        let failed = pool.submit(|| -> anyhow::Result<()> { anyhow::bail!("no such world") });
        let panicked = pool.submit(|| -> anyhow::Result<()> { panic!("corrupt snapshot") });
        let fine = pool.submit(|| Ok("still running"));

        assert!(matches!(failed.get(), Err(PoolError::Failed(m)) if m.contains("no such world")));
        assert!(matches!(panicked.get(), Err(PoolError::Panicked(m)) if m.contains("corrupt snapshot")));
        assert_eq!(fine.get().unwrap(), "still running");
    }

    #[test]
    fn test_shutdown_drains_queue_then_rejects() {
        let pool = WorkerPool::new("test-pool", 1);
        let done = Arc::new(AtomicUsize::new(0));
        let promises: Vec<_> = (0..10)
            .map(|_| {
                let done = done.clone();
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(1));
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(promises.iter().all(|p| p.poll()));

        let late = pool.submit(|| Ok(()));
        assert!(matches!(late.get(), Err(PoolError::ShutDown)));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let pool = WorkerPool::new("test-pool", 1);
        let (_keep, never) = channel::bounded::<()>(1);
        let promise = pool.submit(move || {
            let _ = never.recv_timeout(Duration::from_millis(200));
            Ok(())
        });
        assert!(!promise.wait_timeout(Duration::from_millis(10)));
        assert!(promise.wait_timeout(Duration::from_secs(5)));
    }
}
