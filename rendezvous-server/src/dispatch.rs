//! Bounded worker pool for per-datagram handling
//!
//! Listener threads only read and decode; the handling of each message runs
//! on a pool thread so a slow match never holds up the next read. The queue
//! is bounded: when it is full the datagram is dropped (the sender retries).

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of handing a job to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    /// Queue full; the job was dropped
    Dropped,
    /// Pool is gone; the job was dropped
    Closed,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Cloneable handle listeners use to submit jobs
#[derive(Clone)]
pub struct Dispatcher {
    sender: Option<SyncSender<Job>>,
}

impl Dispatcher {
    /// A dispatcher that runs each job on the calling thread
    pub fn inline() -> Self {
        Dispatcher { sender: None }
    }

    pub fn dispatch(&self, job: Job) -> Dispatch {
        let sender = match &self.sender {
            Some(sender) => sender,
            None => {
                job();
                return Dispatch::Queued;
            }
        };

        match sender.try_send(job) {
            Ok(()) => Dispatch::Queued,
            Err(TrySendError::Full(_)) => Dispatch::Dropped,
            Err(TrySendError::Disconnected(_)) => Dispatch::Closed,
        }
    }
}

// ============================================================================
// WorkerPool
// ============================================================================

pub struct WorkerPool {
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers sharing a queue of `queue_depth` jobs
    ///
    /// A pool of size 0 spawns nothing and its dispatchers run jobs inline.
    pub fn new(size: usize, queue_depth: usize) -> std::io::Result<Self> {
        if size == 0 {
            return Ok(WorkerPool {
                sender: None,
                workers: Vec::new(),
            });
        }

        let (sender, receiver) = mpsc::sync_channel::<Job>(queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("rendezvous-worker-{}", i))
                .spawn(move || worker_loop(receiver))?;
            workers.push(handle);
        }

        Ok(WorkerPool {
            sender: Some(sender),
            workers,
        })
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            sender: self.sender.clone(),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        // Hold the lock only while waiting, not while running the job
        let job = {
            let guard = receiver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.recv()
        };

        match job {
            Ok(job) => job(),
            // Every dispatcher and the pool itself are gone
            Err(_) => break,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit once all senders (including listener clones) are dropped
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::warn!("Worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_jobs_run_on_workers() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(2, 16).unwrap();
            let dispatcher = pool.dispatcher();
            for _ in 0..10 {
                let counter = Arc::clone(&counter);
                let job: Job = Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                assert_eq!(dispatcher.dispatch(job), Dispatch::Queued);
            }
            drop(dispatcher);
            // Drop joins the workers after the queue drains
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_full_queue_drops() {
        let pool = WorkerPool::new(1, 1).unwrap();
        let dispatcher = pool.dispatcher();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        // Occupy the single worker
        let blocker: Job = Box::new(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        });
        assert_eq!(dispatcher.dispatch(blocker), Dispatch::Queued);
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Fill the queue, then overflow it
        assert_eq!(dispatcher.dispatch(Box::new(|| {})), Dispatch::Queued);
        assert_eq!(dispatcher.dispatch(Box::new(|| {})), Dispatch::Dropped);

        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_inline_dispatcher_runs_immediately() {
        let pool = WorkerPool::new(0, 0).unwrap();
        assert_eq!(pool.size(), 0);

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.dispatcher().dispatch(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(Dispatcher::inline().dispatch(Box::new(|| {})), Dispatch::Queued);
    }
}
