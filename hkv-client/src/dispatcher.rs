//! # Completion Dispatcher
//!
//! Purpose: Deliver results produced by the connection's reader task to the
//! operations waiting on them, without letting a misbehaving completion stall
//! or crash the reader.
//!
//! ## Design Principles
//! 1. **Inline First**: Each operation is offered inline completion on the
//!    reader task; only operations that refuse are handed to a scheduler.
//! 2. **Contained Faults**: Panics in either path are caught and logged.
//! 3. **Accounting**: Three monotonic counters record how every completion
//!    was delivered, for diagnostics.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use serde::Serialize;
use tokio::runtime::{Builder, Handle, Runtime};

/// A unit of work that finishes a pending operation.
pub trait Completable: Send + 'static {
    /// Attempts completion.
    ///
    /// With `is_async == false` the call runs on the reader task and may
    /// return `false` to ask for asynchronous delivery instead. The return
    /// value is ignored when `is_async == true`, apart from being logged.
    fn try_complete(&mut self, is_async: bool) -> bool;
}

/// Work item handed to a [`Scheduler`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs away from the reader task.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, job: Job);
}

/// Schedules jobs on a Tokio runtime, normally the one owning the connection.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        TokioScheduler { handle }
    }

    /// Uses the runtime of the calling task.
    ///
    /// # Panics
    /// Panics outside a Tokio runtime.
    pub fn current() -> Self {
        TokioScheduler::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }
}

/// Process-wide completion pool shared by every multiplexer that opts in.
pub struct SharedScheduler {
    runtime: Option<Runtime>,
}

static SHARED: OnceLock<SharedScheduler> = OnceLock::new();

impl SharedScheduler {
    /// Returns the shared pool, building it on first use.
    ///
    /// If the pool cannot be built, jobs fall back to dedicated threads.
    pub fn global() -> &'static SharedScheduler {
        SHARED.get_or_init(|| {
            let runtime = Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("hkv-completion")
                .enable_all()
                .build();
            match runtime {
                Ok(runtime) => SharedScheduler { runtime: Some(runtime) },
                Err(err) => {
                    tracing::warn!(error = %err, "shared completion runtime unavailable, using threads");
                    SharedScheduler { runtime: None }
                }
            }
        })
    }
}

impl Scheduler for SharedScheduler {
    fn schedule(&self, job: Job) {
        match &self.runtime {
            Some(runtime) => {
                runtime.spawn(async move { job() });
            }
            None => {
                let spawned = thread::Builder::new()
                    .name("hkv-completion".to_string())
                    .spawn(job);
                if let Err(err) = spawned {
                    tracing::error!(error = %err, "dropping completion, no thread available");
                }
            }
        }
    }
}

impl fmt::Debug for SharedScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedScheduler")
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}

impl Scheduler for &'static SharedScheduler {
    fn schedule(&self, job: Job) {
        (**self).schedule(job)
    }
}

/// Snapshot of the dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompletionStats {
    /// Inline completion attempts that finished, including ones that panicked.
    pub completed_sync: u64,
    /// Completions handed to the scheduler.
    pub completed_async: u64,
    /// Scheduled completions that panicked.
    pub failed_async: u64,
}

#[derive(Default)]
struct Counters {
    completed_sync: AtomicU64,
    completed_async: AtomicU64,
    failed_async: AtomicU64,
}

/// Routes completions inline or through a [`Scheduler`].
pub struct CompletionDispatcher {
    scheduler: Arc<dyn Scheduler>,
    counters: Arc<Counters>,
}

impl CompletionDispatcher {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        CompletionDispatcher {
            scheduler,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Completes `op` inline if it accepts, otherwise schedules it.
    ///
    /// Never panics because of `op`.
    pub fn complete<C: Completable>(&self, mut op: C) {
        match panic::catch_unwind(AssertUnwindSafe(|| op.try_complete(false))) {
            Ok(true) => {
                self.counters.completed_sync.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(false) => {}
            Err(payload) => {
                self.counters.completed_sync.fetch_add(1, Ordering::Relaxed);
                tracing::error!(panic = panic_message(&*payload), "inline completion panicked");
                return;
            }
        }

        self.counters.completed_async.fetch_add(1, Ordering::Relaxed);
        let counters = Arc::clone(&self.counters);
        self.scheduler.schedule(Box::new(move || {
            let mut op = op;
            match panic::catch_unwind(AssertUnwindSafe(|| op.try_complete(true))) {
                Ok(true) => {}
                Ok(false) => tracing::warn!("completion declined asynchronous delivery"),
                Err(payload) => {
                    counters.failed_async.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        panic = panic_message(&*payload),
                        "asynchronous completion panicked"
                    );
                }
            }
        }));
    }

    pub fn stats(&self) -> CompletionStats {
        CompletionStats {
            completed_sync: self.counters.completed_sync.load(Ordering::Relaxed),
            completed_async: self.counters.completed_async.load(Ordering::Relaxed),
            failed_async: self.counters.failed_async.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CompletionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionDispatcher")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Collects jobs so tests decide when they run.
    #[derive(Default)]
    struct ManualScheduler {
        jobs: Mutex<Vec<Job>>,
    }

    impl ManualScheduler {
        fn run_all(&self) -> usize {
            let jobs = std::mem::take(&mut *self.jobs.lock());
            let count = jobs.len();
            for job in jobs {
                job();
            }
            count
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule(&self, job: Job) {
            self.jobs.lock().push(job);
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Inline,
        Deferred,
        PanicInline,
        PanicDeferred,
    }

    struct Probe {
        behaviour: Behaviour,
        delivered: Arc<AtomicUsize>,
    }

    impl Completable for Probe {
        fn try_complete(&mut self, is_async: bool) -> bool {
            match (self.behaviour, is_async) {
                (Behaviour::PanicInline, false) => panic!("inline boom"),
                (Behaviour::PanicDeferred, true) => panic!("deferred boom"),
                (Behaviour::Deferred | Behaviour::PanicDeferred, false) => return false,
                _ => {}
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn probe(behaviour: Behaviour, delivered: &Arc<AtomicUsize>) -> Probe {
        Probe {
            behaviour,
            delivered: Arc::clone(delivered),
        }
    }

    #[test]
    fn inline_completion_counts_sync() {
        let scheduler = Arc::new(ManualScheduler::default());
        let dispatcher = CompletionDispatcher::new(scheduler.clone());
        let delivered = Arc::new(AtomicUsize::new(0));

        dispatcher.complete(probe(Behaviour::Inline, &delivered));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.run_all(), 0);
        assert_eq!(
            dispatcher.stats(),
            CompletionStats {
                completed_sync: 1,
                completed_async: 0,
                failed_async: 0
            }
        );
    }

    #[test]
    fn refused_completion_is_scheduled() {
        let scheduler = Arc::new(ManualScheduler::default());
        let dispatcher = CompletionDispatcher::new(scheduler.clone());
        let delivered = Arc::new(AtomicUsize::new(0));

        dispatcher.complete(probe(Behaviour::Deferred, &delivered));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.stats().completed_async, 1);
        assert_eq!(scheduler.run_all(), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panics_are_contained_and_counted() {
        let scheduler = Arc::new(ManualScheduler::default());
        let dispatcher = CompletionDispatcher::new(scheduler.clone());
        let delivered = Arc::new(AtomicUsize::new(0));

        dispatcher.complete(probe(Behaviour::PanicInline, &delivered));
        dispatcher.complete(probe(Behaviour::PanicDeferred, &delivered));
        scheduler.run_all();

        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(
            dispatcher.stats(),
            CompletionStats {
                completed_sync: 1,
                completed_async: 1,
                failed_async: 1
            }
        );
    }

    #[test]
    fn counters_match_mixed_workload() {
        let scheduler = Arc::new(ManualScheduler::default());
        let dispatcher = CompletionDispatcher::new(scheduler.clone());
        let delivered = Arc::new(AtomicUsize::new(0));
        let (inline, deferred, failing) = (17, 9, 4);

        for i in 0..(inline + deferred + failing) {
            let behaviour = if i < inline {
                Behaviour::Inline
            } else if i < inline + deferred {
                Behaviour::Deferred
            } else {
                Behaviour::PanicDeferred
            };
            dispatcher.complete(probe(behaviour, &delivered));
        }
        assert_eq!(scheduler.run_all(), (deferred + failing) as usize);

        let stats = dispatcher.stats();
        assert_eq!(stats.completed_sync, inline);
        assert_eq!(stats.completed_async, deferred + failing);
        assert_eq!(stats.failed_async, failing);
        assert_eq!(delivered.load(Ordering::SeqCst), (inline + deferred) as usize);
    }

    #[tokio::test]
    async fn tokio_scheduler_runs_deferred_completions() {
        let dispatcher = CompletionDispatcher::new(Arc::new(TokioScheduler::current()));
        let (tx, rx) = tokio::sync::oneshot::channel();

        struct Deferred(Option<tokio::sync::oneshot::Sender<bool>>);
        impl Completable for Deferred {
            fn try_complete(&mut self, is_async: bool) -> bool {
                if !is_async {
                    return false;
                }
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(is_async);
                }
                true
            }
        }

        dispatcher.complete(Deferred(Some(tx)));
        assert!(rx.await.unwrap());
        assert_eq!(dispatcher.stats().completed_async, 1);
    }

    #[test]
    fn shared_scheduler_runs_jobs() {
        let scheduler = SharedScheduler::global();
        assert!(std::ptr::eq(scheduler, SharedScheduler::global()));

        let (tx, rx) = std::sync::mpsc::channel();
        scheduler.schedule(Box::new(move || {
            let _ = tx.send(thread::current().name().map(str::to_owned));
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("hkv-completion"));
    }
}
