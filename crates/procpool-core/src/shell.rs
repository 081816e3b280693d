//! A single pooled child process and its state machine.
//!
//! A `Shell` owns the spawned child, its stdin writer, and its [`LinePump`].
//! State transitions (`NEW -> STARTING -> READY -> BUSY -> {READY |
//! TERMINATING} -> TERMINATED`) are guarded by a small lock so that
//! "is this shell free to accept work" is a single atomic check-and-set
//! rather than a race between the dispatcher and the shell's own supervisor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::charset::Charset;
use crate::error::PoolError;
use crate::manager::ProcessManager;
use crate::pump::{LinePump, PumpEvent};
use crate::submission::{Submission, SharedSubmission};

/// Grace window given to a child to stop writing after a submission is
/// cancelled mid-command, before its pump backlog is discarded and the shell
/// is handed back to `READY`. If the child is still alive past this window
/// there is nothing unsafe about reusing it -- the window only bounds how
/// long a cancel takes to resolve.
const CANCEL_DRAIN_GRACE: Duration = Duration::from_millis(200);

static NEXT_SHELL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a pooled shell, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShellId(u64);

impl ShellId {
    fn next() -> Self {
        Self(NEXT_SHELL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ShellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shell-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    New,
    Starting,
    Ready,
    Busy,
    Terminating,
    Terminated,
}

/// Authoritative state store: a `Mutex` for atomic check-and-set transitions,
/// mirrored into a `watch` channel so observers (the idle timer, the pool's
/// shutdown sweep) can await a change instead of polling.
struct StateCell {
    gate: StdMutex<ShellState>,
    tx: watch::Sender<ShellState>,
}

impl StateCell {
    fn new(initial: ShellState) -> (Self, watch::Receiver<ShellState>) {
        let (tx, rx) = watch::channel(initial);
        (
            Self {
                gate: StdMutex::new(initial),
                tx,
            },
            rx,
        )
    }

    fn get(&self) -> ShellState {
        *self.gate.lock().unwrap()
    }

    fn set(&self, new: ShellState) {
        *self.gate.lock().unwrap() = new;
        let _ = self.tx.send(new);
    }

    /// Atomically move `from -> to`, returning whether it happened.
    fn try_transition(&self, from: ShellState, to: ShellState) -> bool {
        let mut guard = self.gate.lock().unwrap();
        if *guard == from {
            *guard = to;
            drop(guard);
            let _ = self.tx.send(to);
            true
        } else {
            false
        }
    }
}

/// A pooled child process.
///
/// Held behind `Arc` everywhere: the pool's indices, the per-shell
/// supervisor task, and any in-flight execution task all share ownership,
/// and the last one to drop it reaps the child via its `Drop` impl chain.
pub struct Shell {
    id: ShellId,
    charset: Charset,
    state: StateCell,
    child: AsyncMutex<Child>,
    stdin: AsyncMutex<ChildStdin>,
    pump: AsyncMutex<LinePump>,
}

impl Shell {
    /// Build the command via the manager, spawn it piped on all three
    /// streams, and start the line pumps. The shell is `STARTING` on return;
    /// callers still need to drive it to `READY` via [`Shell::await_startup`].
    pub(crate) async fn spawn(
        manager: &dyn ProcessManager,
        charset: Charset,
    ) -> Result<(Arc<Shell>, watch::Receiver<ShellState>), PoolError> {
        let mut command: TokioCommand = manager.start_process().await?;
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|error| PoolError::ProcessSpawnFailed(error.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::ProcessSpawnFailed("child has no stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::ProcessSpawnFailed("child has no stdout handle".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PoolError::ProcessSpawnFailed("child has no stderr handle".into()))?;

        let pump = LinePump::spawn(stdout, stderr, charset);
        let (state, rx) = StateCell::new(ShellState::Starting);

        let shell = Arc::new(Shell {
            id: ShellId::next(),
            charset,
            state,
            child: AsyncMutex::new(child),
            stdin: AsyncMutex::new(stdin),
            pump: AsyncMutex::new(pump),
        });

        tracing::debug!(shell = %shell.id, "spawned child process");
        Ok((shell, rx))
    }

    pub fn id(&self) -> ShellId {
        self.id
    }

    pub fn state(&self) -> ShellState {
        self.state.get()
    }

    /// Drive `STARTING -> READY`: either immediately (if the manager says
    /// the child starts up instantly) or by waiting for a pump line the
    /// manager recognizes as the startup signal. Returns `Ok(false)` if the
    /// child exits before signalling readiness.
    pub(crate) async fn await_startup(&self, manager: &dyn ProcessManager) -> Result<bool, PoolError> {
        if manager.starts_up_instantly() {
            self.state.set(ShellState::Ready);
            return Ok(true);
        }

        let mut pump = self.pump.lock().await;
        loop {
            tokio::select! {
                event = pump.recv_stdout() => {
                    match event {
                        Some(PumpEvent::Line(line)) => {
                            if manager.is_started_up(&line, true) {
                                self.state.set(ShellState::Ready);
                                return Ok(true);
                            }
                        }
                        Some(PumpEvent::Closed) | None => return Ok(false),
                    }
                }
                event = pump.recv_stderr() => {
                    match event {
                        Some(PumpEvent::Line(line)) => {
                            if manager.is_started_up(&line, false) {
                                self.state.set(ShellState::Ready);
                                return Ok(true);
                            }
                        }
                        Some(PumpEvent::Closed) | None => return Ok(false),
                    }
                }
            }
        }
    }

    /// Atomically claim this shell for execution (`READY -> BUSY`).
    pub(crate) fn try_begin_execute(&self) -> bool {
        self.state.try_transition(ShellState::Ready, ShellState::Busy)
    }

    /// Atomically claim this shell for idle-timeout or shutdown-driven
    /// termination (`READY -> TERMINATING`), without a submission in flight.
    pub(crate) fn try_claim_for_idle_termination(&self) -> bool {
        self.state.try_transition(ShellState::Ready, ShellState::Terminating)
    }

    /// Return a successfully-executed, non-terminating shell to `READY`.
    fn finish_execute_to_ready(&self) -> bool {
        self.state.try_transition(ShellState::Busy, ShellState::Ready)
    }

    async fn write_line(&self, instruction: &str) -> Result<(), PoolError> {
        let mut bytes = self.charset.encode(instruction);
        bytes.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&bytes)
            .await
            .map_err(|error| PoolError::StreamIoError(error.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|error| PoolError::StreamIoError(error.to_string()))
    }

    /// Run one submission to completion. Caller must have already won
    /// `try_begin_execute`. Leaves the shell in `READY` on a clean, non-
    /// terminating finish; otherwise leaves it `BUSY` for the caller to
    /// hand off to [`Shell::terminate`].
    pub(crate) async fn run_submission(
        self: &Arc<Self>,
        shared: &Arc<SharedSubmission>,
    ) -> Result<Duration, PoolError> {
        shared.mark_running();
        shared.submission.on_started_processing();

        let mut pump = self.pump.lock().await;
        let mut outcome: Result<(), PoolError> = Ok(());

        'commands: for command in shared.submission.commands() {
            if shared.is_cancelled() {
                outcome = Err(PoolError::Cancelled);
                break 'commands;
            }

            if let Err(error) = self.write_line(command.instruction()).await {
                outcome = Err(error);
                break 'commands;
            }

            if !command.generates_output() {
                continue;
            }

            loop {
                if shared.is_cancelled() {
                    outcome = Err(PoolError::Cancelled);
                    break 'commands;
                }

                tokio::select! {
                    event = pump.recv_stdout() => {
                        match event {
                            Some(PumpEvent::Line(line)) => {
                                if command.is_completed_stdout(&line) {
                                    break;
                                }
                            }
                            Some(PumpEvent::Closed) | None => {
                                outcome = Err(PoolError::ProcessExitedDuringSubmission);
                                break 'commands;
                            }
                        }
                    }
                    event = pump.recv_stderr() => {
                        match event {
                            Some(PumpEvent::Line(line)) => {
                                if command.is_completed_stderr(&line) {
                                    break;
                                }
                            }
                            Some(PumpEvent::Closed) | None => {
                                outcome = Err(PoolError::ProcessExitedDuringSubmission);
                                break 'commands;
                            }
                        }
                    }
                }
            }
        }

        let mut must_terminate = false;
        if let Err(PoolError::Cancelled) = &outcome {
            if !Self::drain_after_cancel(&mut pump).await {
                must_terminate = true;
            }
        } else if outcome.is_err() {
            must_terminate = true;
        }
        drop(pump);

        shared.submission.on_finished_processing();

        if !must_terminate && shared.submission.terminate_process_afterwards() {
            must_terminate = true;
        }

        let duration = Instant::now().saturating_duration_since(shared.received_time);
        let final_outcome = outcome.map(|_| duration);

        if must_terminate {
            // Caller (pool dispatch loop) observes BUSY and drives termination.
        } else {
            self.finish_execute_to_ready();
        }

        shared.complete(final_outcome.clone());
        final_outcome
    }

    /// Drain whatever the child writes in the `CANCEL_DRAIN_GRACE` window
    /// after a cancelled command stops being waited on. Returns `false` if
    /// the child closed its streams during the window (it is effectively
    /// dead and must be terminated rather than reused).
    async fn drain_after_cancel(pump: &mut LinePump) -> bool {
        let deadline = Instant::now() + CANCEL_DRAIN_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                pump.drain_pending();
                return true;
            }
            tokio::select! {
                event = pump.recv_stdout() => {
                    if matches!(event, Some(PumpEvent::Closed) | None) {
                        return false;
                    }
                }
                event = pump.recv_stderr() => {
                    if matches!(event, Some(PumpEvent::Closed) | None) {
                        return false;
                    }
                }
                _ = tokio::time::sleep(remaining) => {
                    pump.drain_pending();
                    return true;
                }
            }
        }
    }

    /// Low-level stdin write, for use by `ProcessManager::terminate`
    /// implementations that need to send a raw exit instruction outside the
    /// normal submission protocol.
    pub(crate) async fn write_raw(&self, instruction: &str) -> Result<(), PoolError> {
        self.write_line(instruction).await
    }

    /// Low-level next-line reads, for the same `terminate` use case.
    pub(crate) async fn next_stdout_line(&self) -> Option<String> {
        let mut pump = self.pump.lock().await;
        match pump.recv_stdout().await {
            Some(PumpEvent::Line(line)) => Some(line),
            _ => None,
        }
    }

    pub(crate) async fn next_stderr_line(&self) -> Option<String> {
        let mut pump = self.pump.lock().await;
        match pump.recv_stderr().await {
            Some(PumpEvent::Line(line)) => Some(line),
            _ => None,
        }
    }

    /// Force-kill: signal the whole process group, falling back to a plain
    /// `start_kill` if the pid is unavailable.
    async fn force_kill(&self) {
        let mut child = self.child.lock().await;
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: kill() is async-signal-safe; a negative pid targets
                // the whole process group created by setsid() at spawn time.
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
                return;
            }
        }
        let _ = child.start_kill();
    }

    async fn reap(&self) -> Option<i32> {
        let mut child = self.child.lock().await;
        match child.wait().await {
            Ok(status) => status.code(),
            Err(error) => {
                tracing::debug!(shell = %self.id, %error, "error waiting for child exit");
                None
            }
        }
    }

    /// Orderly-then-forceful shutdown: ask the manager to terminate,
    /// force-kill if it declines or fails, then reap. `already_dead` skips
    /// the manager round-trip when the child's streams already closed (a
    /// spontaneous exit or a submission that observed one).
    pub(crate) async fn terminate(self: &Arc<Self>, manager: &dyn ProcessManager, already_dead: bool) -> Option<i32> {
        self.state.set(ShellState::Terminating);

        let orderly = if already_dead {
            false
        } else {
            manager.terminate(ShellHandle { shell: self.clone() }).await
        };

        if !orderly {
            self.force_kill().await;
        }

        let exit_code = self.reap().await;
        self.state.set(ShellState::Terminated);
        exit_code
    }

    /// True if the child has already exited (used by the idle supervisor to
    /// detect a spontaneous exit while the shell sits in `READY`).
    pub(crate) async fn wait_for_spontaneous_exit(&self) {
        let mut child = self.child.lock().await;
        let _ = child.wait().await;
    }
}

/// Handle passed to [`ProcessManager`] callbacks. Thin wrapper so the
/// manager never touches `Shell`'s internals directly.
#[derive(Clone)]
pub struct ShellHandle {
    shell: Arc<Shell>,
}

impl ShellHandle {
    pub(crate) fn new(shell: Arc<Shell>) -> Self {
        Self { shell }
    }

    pub fn id(&self) -> ShellId {
        self.shell.id
    }

    /// Run a submission directly against this shell, bypassing the pool's
    /// dispatch queue. Used by `on_startup` to prime a freshly-ready child.
    /// Returns [`PoolError::PoolClosed`]-shaped failure (as
    /// [`PoolError::Cancelled`]) if the shell was not `READY` to accept it --
    /// it always is, the first time `on_startup` runs.
    pub async fn execute(&self, submission: Arc<dyn Submission>) -> Result<Duration, PoolError> {
        if !self.shell.try_begin_execute() {
            return Err(PoolError::Cancelled);
        }
        let shared = crate::submission::wrap_for_direct_execution(submission);
        self.shell.run_submission(&shared).await
    }

    /// Write a raw instruction line, for `terminate()` implementations.
    pub async fn write_instruction(&self, instruction: &str) -> Result<(), PoolError> {
        self.shell.write_raw(instruction).await
    }

    /// Read the next stdout line, for `terminate()` implementations.
    pub async fn next_stdout_line(&self) -> Option<String> {
        self.shell.next_stdout_line().await
    }

    /// Read the next stderr line, for `terminate()` implementations.
    pub async fn next_stderr_line(&self) -> Option<String> {
        self.shell.next_stderr_line().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::submission::{wrap_for_direct_execution, Submission};
    use async_trait::async_trait;

    struct EchoRepl {
        instant: bool,
    }

    #[async_trait]
    impl ProcessManager for EchoRepl {
        async fn start_process(&self) -> Result<TokioCommand, PoolError> {
            let mut command = TokioCommand::new("sh");
            command
                .arg("-c")
                .arg("echo hi; while IFS= read -r line; do echo \"$line\"; echo done; done");
            Ok(command)
        }

        fn starts_up_instantly(&self) -> bool {
            self.instant
        }

        fn is_started_up(&self, line: &str, is_stdout: bool) -> bool {
            is_stdout && line == "hi"
        }

        async fn on_startup(&self, _shell: ShellHandle) {}
        async fn terminate(&self, _shell: ShellHandle) -> bool {
            false
        }
        async fn on_termination(&self, _exit_code: Option<i32>) {}
    }

    struct ImmediateExit;

    #[async_trait]
    impl ProcessManager for ImmediateExit {
        async fn start_process(&self) -> Result<TokioCommand, PoolError> {
            let mut command = TokioCommand::new("sh");
            command.arg("-c").arg("echo hi");
            Ok(command)
        }
        fn starts_up_instantly(&self) -> bool {
            false
        }
        fn is_started_up(&self, line: &str, is_stdout: bool) -> bool {
            is_stdout && line == "hi"
        }
        async fn on_startup(&self, _shell: ShellHandle) {}
        async fn terminate(&self, _shell: ShellHandle) -> bool {
            false
        }
        async fn on_termination(&self, _exit_code: Option<i32>) {}
    }

    struct TrackingCommand {
        instruction: String,
        terminator: &'static str,
        seen: StdMutex<Vec<String>>,
    }

    impl TrackingCommand {
        fn new(instruction: impl Into<String>) -> Self {
            Self {
                instruction: instruction.into(),
                terminator: "done",
                seen: StdMutex::new(Vec::new()),
            }
        }
    }

    impl Command for TrackingCommand {
        fn instruction(&self) -> &str {
            &self.instruction
        }
        fn is_completed_stdout(&self, line: &str) -> bool {
            self.seen.lock().unwrap().push(line.to_string());
            line == self.terminator
        }
        fn is_completed_stderr(&self, _line: &str) -> bool {
            false
        }
    }

    impl Command for Arc<TrackingCommand> {
        fn instruction(&self) -> &str {
            TrackingCommand::instruction(self)
        }
        fn is_completed_stdout(&self, line: &str) -> bool {
            TrackingCommand::is_completed_stdout(self, line)
        }
        fn is_completed_stderr(&self, line: &str) -> bool {
            TrackingCommand::is_completed_stderr(self, line)
        }
    }

    struct FixedSubmission {
        commands: Vec<Box<dyn Command>>,
        cancelled: std::sync::atomic::AtomicBool,
    }

    impl Submission for FixedSubmission {
        fn commands(&self) -> &[Box<dyn Command>] {
            &self.commands
        }
        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::Relaxed)
        }
    }

    #[tokio::test]
    async fn starting_transitions_to_ready_on_matching_line() {
        let manager = EchoRepl { instant: false };
        let (shell, _rx) = Shell::spawn(&manager, Charset::Latin1).await.unwrap();
        assert_eq!(shell.state(), ShellState::Starting);
        assert!(shell.await_startup(&manager).await.unwrap());
        assert_eq!(shell.state(), ShellState::Ready);
    }

    #[tokio::test]
    async fn instant_startup_skips_the_line_wait() {
        let manager = EchoRepl { instant: true };
        let (shell, _rx) = Shell::spawn(&manager, Charset::Latin1).await.unwrap();
        assert!(shell.await_startup(&manager).await.unwrap());
        assert_eq!(shell.state(), ShellState::Ready);
    }

    #[tokio::test]
    async fn await_startup_observes_spontaneous_exit_before_signalling() {
        let manager = ImmediateExit;
        let (shell, _rx) = Shell::spawn(&manager, Charset::Latin1).await.unwrap();
        assert!(!shell.await_startup(&manager).await.unwrap());
        assert_eq!(shell.state(), ShellState::Starting);
    }

    #[tokio::test]
    async fn commands_execute_in_index_order() {
        let manager = EchoRepl { instant: false };
        let (shell, _rx) = Shell::spawn(&manager, Charset::Latin1).await.unwrap();
        shell.await_startup(&manager).await.unwrap();
        assert!(shell.try_begin_execute());

        let first = Arc::new(TrackingCommand::new("one"));
        let second = Arc::new(TrackingCommand::new("two"));
        let third = Arc::new(TrackingCommand::new("three"));
        let submission = Arc::new(FixedSubmission {
            commands: vec![
                Box::new(first.clone()) as Box<dyn Command>,
                Box::new(second.clone()) as Box<dyn Command>,
                Box::new(third.clone()) as Box<dyn Command>,
            ],
            cancelled: std::sync::atomic::AtomicBool::new(false),
        });
        let shared = wrap_for_direct_execution(submission);
        shell.run_submission(&shared).await.unwrap();
        assert_eq!(shell.state(), ShellState::Ready);

        // Each command saw exactly its own echoed instruction followed by the
        // terminator -- had the shell written "two" before "one" completed,
        // the first command's stream would have observed "two" too.
        assert_eq!(first.seen.lock().unwrap().as_slice(), ["one", "done"]);
        assert_eq!(second.seen.lock().unwrap().as_slice(), ["two", "done"]);
        assert_eq!(third.seen.lock().unwrap().as_slice(), ["three", "done"]);
    }

    #[tokio::test]
    async fn cancelled_submission_writes_no_further_instructions() {
        let manager = EchoRepl { instant: false };
        let (shell, _rx) = Shell::spawn(&manager, Charset::Latin1).await.unwrap();
        shell.await_startup(&manager).await.unwrap();
        assert!(shell.try_begin_execute());

        let submission = Arc::new(FixedSubmission {
            commands: vec![
                Box::new(TrackingCommand::new("one")),
                Box::new(TrackingCommand::new("two")),
            ],
            cancelled: std::sync::atomic::AtomicBool::new(true),
        });
        let shared = wrap_for_direct_execution(submission);
        let outcome = shell.run_submission(&shared).await;
        assert!(matches!(outcome, Err(PoolError::Cancelled)));
    }

    struct ExitsAfterOneLine;

    #[async_trait]
    impl ProcessManager for ExitsAfterOneLine {
        async fn start_process(&self) -> Result<TokioCommand, PoolError> {
            let mut command = TokioCommand::new("sh");
            command.arg("-c").arg("echo hi; read -r line; echo \"$line\"; exit 0");
            Ok(command)
        }
        fn starts_up_instantly(&self) -> bool {
            false
        }
        fn is_started_up(&self, line: &str, is_stdout: bool) -> bool {
            is_stdout && line == "hi"
        }
        async fn on_startup(&self, _shell: ShellHandle) {}
        async fn terminate(&self, _shell: ShellHandle) -> bool {
            false
        }
        async fn on_termination(&self, _exit_code: Option<i32>) {}
    }

    #[tokio::test]
    async fn process_exit_mid_submission_is_reported() {
        let manager = ExitsAfterOneLine;
        let (shell, _rx) = Shell::spawn(&manager, Charset::Latin1).await.unwrap();
        assert!(shell.await_startup(&manager).await.unwrap());
        assert!(shell.try_begin_execute());

        // The child echoes "ping" back (never "done") and then exits,
        // closing its streams before the completion predicate ever fires.
        let submission = Arc::new(FixedSubmission {
            commands: vec![Box::new(TrackingCommand::new("ping"))],
            cancelled: std::sync::atomic::AtomicBool::new(false),
        });
        let shared = wrap_for_direct_execution(submission);
        let outcome = shell.run_submission(&shared).await;
        assert!(matches!(outcome, Err(PoolError::ProcessExitedDuringSubmission)));
    }

    #[tokio::test]
    async fn terminate_after_submission_leaves_shell_busy_for_caller_to_drive() {
        let manager = EchoRepl { instant: true };
        let (shell, _rx) = Shell::spawn(&manager, Charset::Latin1).await.unwrap();
        shell.await_startup(&manager).await.unwrap();
        assert!(shell.try_begin_execute());

        struct TerminatingSubmission {
            commands: Vec<Box<dyn Command>>,
        }
        impl Submission for TerminatingSubmission {
            fn commands(&self) -> &[Box<dyn Command>] {
                &self.commands
            }
            fn terminate_process_afterwards(&self) -> bool {
                true
            }
        }

        let submission = Arc::new(TerminatingSubmission {
            commands: vec![Box::new(TrackingCommand::new("one"))],
        });
        let shared = wrap_for_direct_execution(submission);
        shell.run_submission(&shared).await.unwrap();
        // run_submission never flips BUSY -> READY when the submission asked
        // to terminate afterwards; that's the pool's job, driven by its own
        // observation of the still-BUSY state.
        assert_eq!(shell.state(), ShellState::Busy);

        shell.terminate(&manager, false).await;
        assert_eq!(shell.state(), ShellState::Terminated);
    }
}
