//! The async bridge (spec.md §4.8): a single dedicated OS thread owns a
//! `tokio` event loop, and synchronous FUSE callbacks submit a future and
//! block the calling (kernel-servicing) thread on a reply channel rather
//! than entering the loop themselves. Grounded in
//! `task_executor::Executor` (`spawn`/`block_on`/`shutdown` shape), trimmed
//! of its task-local stdio/workunit plumbing, with the startup/shutdown
//! handshake taken from `brfs::main`'s own `std::sync::mpsc::channel`
//! rendezvous between the FUSE session and its caller.

use crate::error::{CampusFsError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

/// Handle to the scheduler loop thread. Cheap to clone; every clone shares
/// the same underlying thread and runtime.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    handle: Handle,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawns the loop thread, runs `setup` on it to build whatever the
    /// caller needs constructed with access to the loop (an HTTP client, an
    /// authenticated catalog, the root `RealPath`), and blocks the calling
    /// thread until `setup` has either published its result or failed.
    ///
    /// If `setup` errors the loop thread tears itself down immediately and
    /// the error is returned here; this is how an auth failure aborts
    /// startup (spec.md §7 policy table).
    pub fn start<F, Fut, T>(setup: F) -> Result<(Scheduler, T)>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(Handle, T)>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let join = std::thread::Builder::new()
            .name("campusfs-scheduler".into())
            .spawn(move || {
                let rt = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = ready_tx.send(Err(CampusFsError::Protocol(format!(
                            "failed to start scheduler runtime: {err}"
                        ))));
                        return;
                    }
                };
                let handle = rt.handle().clone();
                rt.block_on(async move {
                    match setup().await {
                        Ok(value) => {
                            if ready_tx.send(Ok((handle, value))).is_err() {
                                // Caller gave up waiting; nothing left to serve.
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    }
                    let _ = stop_rx.await;
                });
            })
            .map_err(|err| {
                CampusFsError::Protocol(format!("failed to spawn scheduler thread: {err}"))
            })?;

        let (handle, value) = match ready_rx.recv() {
            Ok(result) => result?,
            Err(_) => {
                // The loop thread dropped its sender without publishing, which
                // only happens if it panicked before reaching setup().
                let _ = join.join();
                return Err(CampusFsError::Protocol(
                    "scheduler thread exited before startup completed".into(),
                ));
            }
        };

        Ok((
            Scheduler {
                inner: Arc::new(Inner {
                    handle,
                    stop: Mutex::new(Some(stop_tx)),
                    join: Mutex::new(Some(join)),
                }),
            },
            value,
        ))
    }

    /// Submits `fut` to the loop thread and blocks the calling thread until
    /// it resolves. Safe to call concurrently from many kernel-servicing
    /// threads; each call gets its own reply channel.
    pub fn call<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.blocking_recv().map_err(|_| {
            CampusFsError::Cancelled("scheduler loop stopped before returning a result".into())
        })
    }

    /// Returns a `Handle` for callers that need to spawn background work on
    /// the loop without waiting for it (e.g. prefetching).
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Signals the loop thread to exit and joins it, abandoning it if it
    /// hasn't stopped within `timeout` (spec.md §4.8: "~20s before
    /// abandoning it"). Idempotent: a second call is a no-op.
    pub fn shutdown(&self, timeout: Duration) {
        if let Some(stop_tx) = self.inner.stop.lock().take() {
            let _ = stop_tx.send(());
        }
        let Some(join) = self.inner.join.lock().take() else {
            return;
        };
        let (done_tx, done_rx) = std_mpsc::channel();
        std::thread::spawn(move || {
            let _ = join.join();
            let _ = done_tx.send(());
        });
        if done_rx.recv_timeout(timeout).is_err() {
            log::warn!("scheduler thread did not stop within {timeout:?}; abandoning it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_publishes_setup_result_and_call_runs_on_the_loop() {
        let (scheduler, root) = Scheduler::start(|| async { Ok::<_, CampusFsError>(42) }).unwrap();
        assert_eq!(root, 42);

        let doubled = scheduler.call(async move { root * 2 }).unwrap();
        assert_eq!(doubled, 84);

        scheduler.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn failed_setup_aborts_start() {
        let result: Result<(Scheduler, ())> =
            Scheduler::start(|| async { Err(CampusFsError::Auth("bad credentials".into())) });
        assert!(matches!(result, Err(CampusFsError::Auth(_))));
    }

    #[test]
    fn concurrent_calls_are_served_independently() {
        let (scheduler, ()) = Scheduler::start(|| async { Ok(()) }).unwrap();
        let scheduler = Arc::new(scheduler);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || scheduler.call(async move { i * i }).unwrap())
            })
            .collect();
        let mut results: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);

        scheduler.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (scheduler, ()) = Scheduler::start(|| async { Ok(()) }).unwrap();
        scheduler.shutdown(Duration::from_secs(5));
        scheduler.shutdown(Duration::from_secs(5));
    }
}
