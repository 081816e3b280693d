//! The public [`ProcessPool`]: sizing, dispatch, and shutdown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::PoolError;
use crate::manager::{ProcessManager, ProcessManagerFactory};
use crate::settings::PoolSettings;
use crate::shell::{Shell, ShellHandle, ShellId, ShellState};
use crate::submission::{self, PendingQueue, SharedSubmission, Submission, SubmissionHandle};

#[derive(Clone)]
struct ShellEntry {
    shell: Arc<Shell>,
    manager: Arc<dyn ProcessManager>,
}

struct PoolInner {
    settings: PoolSettings,
    factory: Arc<dyn ProcessManagerFactory>,
    shells: StdMutex<HashMap<ShellId, ShellEntry>>,
    ready: StdMutex<HashSet<ShellId>>,
    queue: PendingQueue,
    queue_notify: Arc<Notify>,
    ready_notify: Notify,
    shutdown_notify: Notify,
    executing: AtomicUsize,
    closing: AtomicBool,
}

impl PoolInner {
    fn insert_shell(&self, shell: Arc<Shell>, manager: Arc<dyn ProcessManager>) {
        self.shells.lock().unwrap().insert(shell.id(), ShellEntry { shell, manager });
    }

    fn remove_shell(&self, id: ShellId) {
        self.shells.lock().unwrap().remove(&id);
        self.ready.lock().unwrap().remove(&id);
    }

    fn mark_ready(&self, id: ShellId) {
        self.ready.lock().unwrap().insert(id);
        self.ready_notify.notify_waiters();
    }

    /// Pick a shell that is still `READY`, atomically claim it, and remove
    /// it from the ready index. Skips (and drops) any stale entries whose
    /// shell moved on between being indexed as ready and being picked here.
    fn claim_ready_shell(&self) -> Option<(ShellId, Arc<Shell>, Arc<dyn ProcessManager>)> {
        let candidates: Vec<ShellId> = self.ready.lock().unwrap().iter().copied().collect();
        for id in candidates {
            let entry = self.shells.lock().unwrap().get(&id).cloned();
            let Some(entry) = entry else {
                self.ready.lock().unwrap().remove(&id);
                continue;
            };
            let claimed = entry.shell.try_begin_execute();
            self.ready.lock().unwrap().remove(&id);
            if claimed {
                return Some((id, entry.shell, entry.manager));
            }
        }
        None
    }

    fn total_shells(&self) -> usize {
        self.shells.lock().unwrap().len()
    }

    fn queue_depth(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Grow the pool toward the sizing formula's target. Never shrinks
    /// proactively -- shrink happens only via each shell's own idle timeout.
    async fn reconcile_sizing(self: &Arc<Self>) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        let desired = self
            .settings
            .desired_size(self.executing.load(Ordering::Acquire), self.queue_depth());
        let current = self.total_shells();
        for _ in current..desired {
            tokio::spawn(bring_up_shell(self.clone()));
        }
    }
}

/// A pool of long-lived, interactive child processes, dispatched over a
/// line-oriented stdio protocol defined entirely by the client's
/// [`ProcessManager`], [`Submission`], and [`Command`](crate::Command)
/// implementations.
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl ProcessPool {
    /// Validate `settings`, spawn the initial `max(minPoolSize, reserveSize)`
    /// shells and block until each reaches `READY` (or fails to), then start
    /// the background dispatcher.
    pub async fn new(
        factory: Arc<dyn ProcessManagerFactory>,
        settings: PoolSettings,
    ) -> Result<Self, PoolError> {
        settings.validate()?;

        let inner = Arc::new(PoolInner {
            settings,
            factory,
            shells: StdMutex::new(HashMap::new()),
            ready: StdMutex::new(HashSet::new()),
            queue: Arc::new(StdMutex::new(VecDeque::new())),
            queue_notify: Arc::new(Notify::new()),
            ready_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            executing: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        });

        let initial = settings.initial_size();
        let handles: Vec<_> = (0..initial)
            .map(|_| tokio::spawn(bring_up_shell(inner.clone())))
            .collect();
        for handle in handles {
            let _ = handle.await;
        }

        tokio::spawn(dispatch_loop(inner.clone()));

        Ok(Self { inner })
    }

    /// Enqueue a submission. Returns immediately with a handle the caller
    /// uses to wait for, poll, or cancel it; never blocks on a shell being
    /// available.
    pub fn submit(&self, submission: Arc<dyn Submission>) -> Result<SubmissionHandle, PoolError> {
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }
        if submission.commands().is_empty() {
            return Err(PoolError::InvalidConfiguration(
                "a submission must contain at least one command".into(),
            ));
        }

        let (_, handle) = submission::enqueue(
            submission,
            self.inner.queue.clone(),
            self.inner.queue_notify.clone(),
        );
        Ok(handle)
    }

    /// Stop accepting new submissions, resolve everything still queued with
    /// [`PoolError::PoolClosed`], let in-flight submissions finish, then
    /// terminate every shell. Returns once the pool is fully drained.
    pub async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::Release);
        self.inner.shutdown_notify.notify_waiters();
        self.inner.queue_notify.notify_waiters();
        self.inner.ready_notify.notify_waiters();

        let leftover: Vec<Arc<SharedSubmission>> = self.inner.queue.lock().unwrap().drain(..).collect();
        for shared in leftover {
            shared.complete(Err(PoolError::PoolClosed));
        }

        while self.inner.total_shells() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Snapshot of pool occupancy, for diagnostics/tests.
    pub fn shell_count(&self) -> usize {
        self.inner.total_shells()
    }
}

/// Spawn a child, drive it to `READY`, prime it via `on_startup`, and -- if
/// it is still `READY` afterwards -- expose it to the dispatcher and start
/// its idle-timeout/spontaneous-exit supervisor. Errors are logged, not
/// propagated: a failed spawn just leaves the pool a shell short until the
/// next `reconcile_sizing` tries again.
async fn bring_up_shell(pool: Arc<PoolInner>) {
    if let Err(error) = try_bring_up_shell(&pool).await {
        tracing::warn!(%error, "failed to bring a pool shell up");
    }
}

async fn try_bring_up_shell(pool: &Arc<PoolInner>) -> Result<(), PoolError> {
    let manager: Arc<dyn ProcessManager> = Arc::from(pool.factory.new_process_manager());
    let (shell, state_rx) = Shell::spawn(manager.as_ref(), pool.settings.charset).await?;
    pool.insert_shell(shell.clone(), manager.clone());

    let started = shell.await_startup(manager.as_ref()).await?;
    if !started {
        pool.remove_shell(shell.id());
        manager.on_termination(None).await;
        return Ok(());
    }

    manager.on_startup(ShellHandle::new(shell.clone())).await;

    match shell.state() {
        ShellState::Ready => {
            pool.mark_ready(shell.id());
            tokio::spawn(supervise(pool.clone(), shell, manager, state_rx));
        }
        _ => {
            finalize_termination(pool, &shell, &manager, false).await;
        }
    }
    Ok(())
}

/// Per-shell background task, alive from just after `on_startup` until the
/// shell terminates. Rearms an idle timer every time the shell is `READY`
/// and reacts to a spontaneous child exit or a pool shutdown while idle.
/// Execution itself (driven by [`dispatch_loop`] or `on_startup`) is left
/// entirely alone -- this task just watches `state_rx` while `BUSY`.
async fn supervise(
    pool: Arc<PoolInner>,
    shell: Arc<Shell>,
    manager: Arc<dyn ProcessManager>,
    mut state_rx: tokio::sync::watch::Receiver<ShellState>,
) {
    loop {
        match *state_rx.borrow_and_update() {
            ShellState::Terminating | ShellState::Terminated => return,
            ShellState::Busy | ShellState::New | ShellState::Starting => {
                if state_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }
            ShellState::Ready => {}
        }

        // Register before re-checking `closing`: `shutdown()` flips the flag
        // and then notifies, and if this task read `closing` as false but
        // only subscribed to the notification after `notify_waiters()` ran,
        // it would sleep through the shutdown signal until its next idle
        // timeout (or forever, with `keepAliveMs == 0`).
        let shutdown_wait = pool.shutdown_notify.notified();

        if pool.closing.load(Ordering::Acquire) {
            drop(shutdown_wait);
            if shell.try_claim_for_idle_termination() {
                finalize_termination(&pool, &shell, &manager, false).await;
            }
            return;
        }

        let keep_alive = pool.settings.keep_alive;
        let idle_deadline = async {
            if keep_alive.is_zero() {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(keep_alive).await;
            }
        };

        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown_wait => {
                if shell.try_claim_for_idle_termination() {
                    finalize_termination(&pool, &shell, &manager, false).await;
                    return;
                }
            }
            _ = shell.wait_for_spontaneous_exit() => {
                if shell.try_claim_for_idle_termination() {
                    finalize_termination(&pool, &shell, &manager, true).await;
                    return;
                }
            }
            _ = idle_deadline => {
                if shell.try_claim_for_idle_termination() {
                    finalize_termination(&pool, &shell, &manager, false).await;
                    return;
                }
            }
        }
    }
}

async fn finalize_termination(pool: &Arc<PoolInner>, shell: &Arc<Shell>, manager: &Arc<dyn ProcessManager>, already_dead: bool) {
    let exit_code = shell.terminate(manager.as_ref(), already_dead).await;
    // Pool bookkeeping happens before the client callback, per spec.md
    // §4.3's adapter order: `onTermination` must observe the shell already
    // gone from `allShells`/`readyShells`, not still present.
    pool.remove_shell(shell.id());
    manager.on_termination(exit_code).await;
    pool.reconcile_sizing().await;
}

/// Single task owning the FIFO: for each queued submission, try every
/// currently-`READY` shell until one accepts it, then hand the execution off
/// to its own task and move on to the next submission.
async fn dispatch_loop(pool: Arc<PoolInner>) {
    loop {
        let front = pool.queue.lock().unwrap().front().cloned();

        let Some(shared) = front else {
            // Register before the closing re-check for the same reason as
            // `SubmissionHandle::wait`: a submission enqueued (or shutdown
            // requested) between the snapshot above and this select must
            // still be observed, not missed because the wait hadn't started.
            let queue_wait = pool.queue_notify.notified();
            let shutdown_wait = pool.shutdown_notify.notified();
            if pool.closing.load(Ordering::Acquire) {
                return;
            }
            if pool.queue.lock().unwrap().front().is_some() {
                continue;
            }
            tokio::select! {
                _ = queue_wait => {}
                _ = shutdown_wait => {}
            }
            continue;
        };

        if shared.is_cancelled() {
            let mut queue = pool.queue.lock().unwrap();
            if queue.front().map(|s| Arc::ptr_eq(s, &shared)).unwrap_or(false) {
                queue.pop_front();
            }
            drop(queue);
            shared.complete(Err(PoolError::Cancelled));
            continue;
        }

        match pool.claim_ready_shell() {
            Some((shell_id, shell, manager)) => {
                let mut queue = pool.queue.lock().unwrap();
                if queue.front().map(|s| Arc::ptr_eq(s, &shared)).unwrap_or(false) {
                    queue.pop_front();
                    drop(queue);
                } else {
                    // The submission we meant to hand off was cancelled out
                    // from under us between the peek above and claiming a
                    // shell; give the shell back and retry.
                    drop(queue);
                    pool.mark_ready(shell_id);
                    continue;
                }

                pool.executing.fetch_add(1, Ordering::AcqRel);
                tokio::spawn(run_and_settle(pool.clone(), shell, manager, shared));
                pool.reconcile_sizing().await;
            }
            None => {
                // Register before `reconcile_sizing()` runs: a shell that
                // becomes ready while sizing is being reconciled (e.g. one
                // of the shells it just spawned starting up) must still
                // wake this select, not be missed because the wait hadn't
                // started yet.
                let ready_wait = pool.ready_notify.notified();
                let queue_wait = pool.queue_notify.notified();
                let shutdown_wait = pool.shutdown_notify.notified();

                // No ready shell could take the head submission -- this is
                // exactly the signal the sizing formula needs queueDepth
                // for. Without this, a pool with `minPoolSize == 0` would
                // never spawn its first shell: nothing else triggers
                // reconciliation until a shell finishes or terminates.
                pool.reconcile_sizing().await;

                if !pool.ready.lock().unwrap().is_empty() {
                    continue;
                }
                tokio::select! {
                    _ = ready_wait => {}
                    _ = queue_wait => {}
                    _ = shutdown_wait => {}
                }
            }
        }
    }
}

async fn run_and_settle(
    pool: Arc<PoolInner>,
    shell: Arc<Shell>,
    manager: Arc<dyn ProcessManager>,
    shared: Arc<SharedSubmission>,
) {
    let outcome = shell.run_submission(&shared).await;
    pool.executing.fetch_sub(1, Ordering::AcqRel);

    match shell.state() {
        ShellState::Ready => pool.mark_ready(shell.id()),
        _ => {
            let already_dead = matches!(outcome, Err(PoolError::ProcessExitedDuringSubmission));
            finalize_termination(&pool, &shell, &manager, already_dead).await;
        }
    }
}
