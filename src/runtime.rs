//! Worker pool and per-connection serialization contexts.
//!
//! The pool is a multi-threaded tokio runtime with a fixed number of
//! workers. A [`SerialContext`] binds a unit of work (the accept loop or
//! one session) to a single task: the task's steps resume on whichever
//! worker is idle, but never two at once.

use std::future::Future;
use std::io;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::task::JoinHandle;

/// The executor shared by the listener and every session.
pub struct Runtime {
    inner: tokio::runtime::Runtime,
}

impl Runtime {
    /// Build a runtime with exactly `workers` worker threads.
    pub fn new(workers: NonZeroUsize) -> io::Result<Self> {
        let inner = Builder::new_multi_thread()
            .worker_threads(workers.get())
            .thread_name("ws-worker")
            .enable_all()
            .build()?;

        Ok(Self { inner })
    }

    /// Cheap, cloneable handle used to spawn work onto the pool.
    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            inner: self.inner.handle().clone(),
        }
    }

    /// Block the calling thread until `stop` completes.
    ///
    /// The workers keep running ready completions meanwhile; `stop` itself
    /// is polled on the calling thread.
    pub fn run_until_stopped<F: Future>(&self, stop: F) -> F::Output {
        self.inner.block_on(stop)
    }

    /// Stop the pool. Tasks still pending are dropped, which closes their sockets.
    pub fn shutdown(self, grace: Duration) {
        self.inner.shutdown_timeout(grace);
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    inner: Handle,
}

impl RuntimeHandle {
    /// Handle for the runtime the caller is already running in.
    ///
    /// Panics outside of a tokio runtime.
    #[cfg(test)]
    pub fn current() -> Self {
        Self {
            inner: Handle::current(),
        }
    }

    /// Fresh context for one connection (or for the accept loop).
    pub fn make_serialization_context(&self) -> SerialContext {
        SerialContext {
            handle: self.inner.clone(),
        }
    }

    /// Enter the runtime so I/O objects can register with its reactor.
    pub fn enter(&self) -> tokio::runtime::EnterGuard<'_> {
        self.inner.enter()
    }
}

/// A one-shot serialization context.
///
/// Spawning consumes the context, so every step bound to it lives in one
/// task and its handlers can never overlap.
#[derive(Debug)]
pub struct SerialContext {
    handle: Handle,
}

impl SerialContext {
    pub fn spawn<F>(self, work: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_test::assert_ok;

    fn workers(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_zero_workers_unrepresentable() {
        assert!(NonZeroUsize::new(0).is_none());
    }

    #[test]
    fn test_run_until_stopped_returns_stop_output() {
        let runtime = Runtime::new(workers(1)).unwrap();
        let value = runtime.run_until_stopped(async { 42 });
        assert_eq!(value, 42);
        runtime.shutdown(Duration::from_millis(100));
    }

    #[test]
    fn test_contexts_run_in_parallel() {
        let runtime = Runtime::new(workers(2)).unwrap();
        let handle = runtime.handle();

        // Two tasks that each wait for the other would deadlock if the
        // contexts shared a single serialized queue.
        let (tx_a, rx_a) = std::sync::mpsc::channel::<()>();
        let (tx_b, rx_b) = std::sync::mpsc::channel::<()>();

        let a = handle.make_serialization_context().spawn(async move {
            tx_a.send(()).unwrap();
            rx_b.recv_timeout(Duration::from_secs(5)).is_ok()
        });
        let b = handle.make_serialization_context().spawn(async move {
            tx_b.send(()).unwrap();
            rx_a.recv_timeout(Duration::from_secs(5)).is_ok()
        });

        let (a, b) = runtime.run_until_stopped(async { (a.await, b.await) });
        assert!(assert_ok!(a));
        assert!(assert_ok!(b));
        runtime.shutdown(Duration::from_millis(100));
    }

    #[test]
    fn test_context_steps_never_overlap() {
        let runtime = Runtime::new(workers(4)).unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let task = {
            let in_flight = Arc::clone(&in_flight);
            let overlaps = Arc::clone(&overlaps);
            runtime
                .handle()
                .make_serialization_context()
                .spawn(async move {
                    for _ in 0..100 {
                        if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::task::yield_now().await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    }
                })
        };

        assert_ok!(runtime.run_until_stopped(task));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        runtime.shutdown(Duration::from_millis(100));
    }

    #[test]
    fn test_shutdown_drops_pending_tasks() {
        struct DropFlag(Arc<AtomicUsize>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let runtime = Runtime::new(workers(1)).unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        let flag = DropFlag(Arc::clone(&dropped));

        runtime
            .handle()
            .make_serialization_context()
            .spawn(async move {
                let _flag = flag;
                std::future::pending::<()>().await;
            });

        runtime.run_until_stopped(tokio::task::yield_now());
        runtime.shutdown(Duration::from_secs(1));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
