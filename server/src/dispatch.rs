//! Fixed worker pool dispatching accepted connections
//!
//! The listener hands accepted streams to [`WorkerPool::submit`]; a fixed
//! set of OS threads claims them in FIFO order and runs the connection
//! handler. Shutdown is cooperative: the shared [`ShutdownToken`] is
//! observed at the top of every worker iteration and after every wake, new
//! submissions are refused once it trips, queued-but-unclaimed connections
//! are closed without being handled, and in-flight handlers always run to
//! completion before the workers are joined.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};
use shared::{CofferError, CofferResult, MAX_CONNECTIONS};

/// Cooperative cancellation flag shared by the pool, its workers, and the
/// accept loop. Replaces ambient global state: whoever constructs the pool
/// decides who else may trip it.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    triggered: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// What a worker runs for each claimed connection. The pool knows nothing
/// about the request protocol behind this trait.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, stream: TcpStream, peer: SocketAddr);
}

impl<F> ConnectionHandler for F
where
    F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
{
    fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        self(stream, peer)
    }
}

/// One queued connection. Owned by the pool from submit until a worker
/// claims it or a drain drops it (dropping the stream closes the
/// descriptor exactly once).
struct Job {
    stream: TcpStream,
    peer: SocketAddr,
}

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    /// Signaled once per submitted job to wake one waiting worker.
    not_empty: Condvar,
    /// Signaled whenever the queue count returns to zero, from both the
    /// worker dequeue path and the drain path; shutdown waits on it.
    empty: Condvar,
    token: ShutdownToken,
    handler: Box<dyn ConnectionHandler>,
}

/// Fixed-size dispatch pool over a FIFO connection queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns exactly `size` workers sharing `token`.
    ///
    /// `size` must be in `1..=MAX_CONNECTIONS`. If any worker thread fails
    /// to spawn, everything spawned so far is torn down before the error
    /// is returned; a partial pool is never handed to the caller.
    pub fn new(
        size: usize,
        handler: impl ConnectionHandler,
        token: ShutdownToken,
    ) -> CofferResult<Self> {
        if size == 0 || size > MAX_CONNECTIONS {
            return Err(CofferError::InvalidArgument("pool size out of range"));
        }

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            empty: Condvar::new(),
            token,
            handler: Box::new(handler),
        });

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let shared = Arc::clone(&shared);
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("coffer-worker-{index}"))
                .spawn(move || worker_loop(&worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.token.trigger();
                    shared.not_empty.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(CofferError::ResourceExhausted(format!(
                        "failed to spawn worker thread: {e}"
                    )));
                }
            }
        }

        info!("dispatch pool running with {} workers", size);
        Ok(Self { shared, workers })
    }

    /// Queues a connection at the tail and wakes one worker.
    ///
    /// Refused once shutdown has been requested: a draining pool must not
    /// silently swallow new connections.
    pub fn submit(&self, stream: TcpStream, peer: SocketAddr) -> CofferResult<()> {
        if self.shared.token.is_triggered() {
            return Err(CofferError::InvalidArgument("pool is shutting down"));
        }
        {
            let mut queue = self.shared.queue.lock();
            queue.push_back(Job { stream, peer });
        }
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Connections currently queued and unclaimed.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Drops every queued job without invoking the handler; each dropped
    /// stream closes its descriptor. Returns how many were discarded.
    pub fn drain(&self) -> usize {
        let mut queue = self.shared.queue.lock();
        let dropped = queue.len();
        queue.clear();
        self.shared.empty.notify_all();
        dropped
    }

    /// Graceful shutdown: trip the token, discard pending jobs, wait for
    /// the queue to report empty, wake every worker, and join them. Workers
    /// finish their in-flight connection; nothing is cancelled mid-job.
    pub fn shutdown(self) {
        // Drop runs the teardown.
    }

    fn shutdown_inner(&mut self) {
        self.shared.token.trigger();

        let dropped = self.drain();
        if dropped > 0 {
            info!("discarded {} queued connections on shutdown", dropped);
        }

        {
            let mut queue = self.shared.queue.lock();
            while !queue.is_empty() {
                self.shared.empty.wait(&mut queue);
            }
        }

        self.shared.not_empty.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
        info!("dispatch pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown_inner();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.token.is_triggered() {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    if queue.is_empty() {
                        shared.empty.notify_all();
                    }
                    break job;
                }
                // Predicate is re-checked after every wake; a spurious
                // wakeup with an empty queue just waits again.
                shared.not_empty.wait(&mut queue);
            }
        };

        debug!("worker {:?} handling {}", thread::current().name(), job.peer);
        shared.handler.handle(job.stream, job.peer);
    }
}
