//! The `Submission` client contract, its pool-internal wrapper, and the
//! future handed back from `ProcessPool::submit`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::command::Command;
use crate::error::PoolError;

/// An ordered, non-empty sequence of commands to run on one shell.
pub trait Submission: Send + Sync {
    /// Commands to execute in order against whichever shell accepts this
    /// submission. Must be non-empty.
    fn commands(&self) -> &[Box<dyn Command>];

    /// Whether the shell should be terminated after the last command
    /// completes, instead of being returned to the ready set.
    fn terminate_process_afterwards(&self) -> bool {
        false
    }

    /// Invoked once the shell has committed to running this submission.
    fn on_started_processing(&self) {}

    /// Invoked once the last command completes (successfully or not),
    /// before the shell decides whether to terminate.
    fn on_finished_processing(&self) {}

    /// Consulted before writing the next instruction. A client-owned
    /// timeout or external cancellation signal surfaces here.
    fn is_cancelled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
enum Lifecycle {
    Queued,
    Running,
    Done(Result<Duration, PoolError>),
}

/// Pool-internal wrapper around a client `Submission`.
///
/// Invariant: `received_time <= submitted_time <= processed_time` once all
/// three are set (`submitted_time`/`processed_time` live implicitly in the
/// `Instant::now()` calls taken when the dispatcher picks the submission up
/// and when it finishes, respectively — only `received_time` needs to be
/// captured up front since duration is computed as `processed - received`).
pub(crate) struct SharedSubmission {
    pub submission: Arc<dyn Submission>,
    pub received_time: Instant,
    cancelled: AtomicBool,
    lifecycle: StdMutex<Lifecycle>,
    notify: Notify,
}

impl SharedSubmission {
    fn new(submission: Arc<dyn Submission>) -> Arc<Self> {
        Arc::new(Self {
            submission,
            received_time: Instant::now(),
            cancelled: AtomicBool::new(false),
            lifecycle: StdMutex::new(Lifecycle::Queued),
            notify: Notify::new(),
        })
    }

    /// True if either the future was cancelled or the client's own
    /// `is_cancelled()` predicate says so.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.submission.is_cancelled()
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(*self.lifecycle.lock().unwrap(), Lifecycle::Done(_))
    }

    pub(crate) fn mark_running(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if matches!(*lifecycle, Lifecycle::Queued) {
            *lifecycle = Lifecycle::Running;
        }
    }

    pub(crate) fn complete(&self, outcome: Result<Duration, PoolError>) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if matches!(*lifecycle, Lifecycle::Done(_)) {
                return;
            }
            *lifecycle = Lifecycle::Done(outcome);
        }
        self.notify.notify_waiters();
    }

    fn snapshot(&self) -> Option<Result<Duration, PoolError>> {
        match &*self.lifecycle.lock().unwrap() {
            Lifecycle::Done(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }
}

/// FIFO of submissions awaiting dispatch, shared between the pool and every
/// outstanding `SubmissionHandle` so `cancel()` can drop a still-queued
/// submission without going through the async dispatcher.
pub(crate) type PendingQueue = Arc<StdMutex<VecDeque<Arc<SharedSubmission>>>>;

/// Wrap a submission for execution outside the queue entirely (used by
/// `ShellHandle::execute` from `on_startup`, which runs before the shell is
/// ever exposed to the pool's dispatcher).
pub(crate) fn wrap_for_direct_execution(submission: Arc<dyn Submission>) -> Arc<SharedSubmission> {
    SharedSubmission::new(submission)
}

/// Enqueue a submission and return its handle plus the shared wrapper the
/// dispatcher will pick up.
pub(crate) fn enqueue(
    submission: Arc<dyn Submission>,
    queue: PendingQueue,
    queue_notify: Arc<Notify>,
) -> (Arc<SharedSubmission>, SubmissionHandle) {
    let shared = SharedSubmission::new(submission);
    queue.lock().unwrap().push_back(shared.clone());
    queue_notify.notify_one();
    let handle = SubmissionHandle {
        shared: shared.clone(),
        queue,
        queue_notify,
    };
    (shared, handle)
}

/// Handle to a submission accepted by the pool.
///
/// Mirrors a `Future<Duration>`: `wait`/`wait_timeout` block until the
/// submission resolves, `cancel` attempts to drop it before it runs (or asks
/// the running shell to stop after its current command), and
/// `is_cancelled`/`is_done` report terminal state without blocking.
pub struct SubmissionHandle {
    shared: Arc<SharedSubmission>,
    queue: PendingQueue,
    queue_notify: Arc<Notify>,
}

impl SubmissionHandle {
    /// Block until the submission is processed, cancelled, or the shell
    /// died during execution. Resolves to the wall-clock duration from
    /// acceptance (`submit()` returning) to completion.
    pub async fn wait(&self) -> Result<Duration, PoolError> {
        loop {
            // Register as a waiter *before* checking the snapshot: `Notify`
            // captures enough state at creation time that a `complete()`
            // landing between the check and the `.await` below is still
            // observed, rather than being missed because no one was
            // listening yet.
            let notified = self.shared.notify.notified();
            if let Some(outcome) = self.shared.snapshot() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Same as [`Self::wait`] but raises [`PoolError::Timeout`] if the
    /// submission has not resolved within `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Duration, PoolError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PoolError::Timeout),
        }
    }

    /// Attempt to cancel. If still queued, removes it from the queue and
    /// resolves the future with [`PoolError::Cancelled`] immediately,
    /// returning `true`. If already running, sets the cooperative
    /// cancellation flag the shell's execute loop polls between commands
    /// (best-effort — `may_interrupt` does not force a kill) and returns
    /// `true`. Returns `false` if the submission already completed.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        if self.shared.is_done() {
            return false;
        }

        self.shared.cancelled.store(true, Ordering::Release);

        let mut queue = self.queue.lock().unwrap();
        let was_queued = queue.iter().any(|s| Arc::ptr_eq(s, &self.shared));
        if was_queued {
            queue.retain(|s| !Arc::ptr_eq(s, &self.shared));
            drop(queue);
            self.shared.complete(Err(PoolError::Cancelled));
            self.queue_notify.notify_one();
            return true;
        }
        drop(queue);

        // Already dispatched to a shell: cooperative cancellation only.
        let _ = may_interrupt;
        true
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.snapshot(), Some(Err(PoolError::Cancelled))) || self.shared.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }
}
