//! End-to-end pool scenarios against real `/bin/sh` children, covering the
//! handshake/termination/cancellation/sizing behaviors a pool client relies
//! on. Scaled down from "production" timings (e.g. a few hundred ms instead
//! of several seconds) so the suite stays fast; the shapes of the scenarios
//! are unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as TokioCommand;

use procpool_core::{
    Command, PoolError, PoolSettings, ProcessManager, ProcessManagerFactory, ProcessPool,
    ShellHandle, Submission,
};
use procpool_demo::{ShManagerFactory, ShellScript};

fn default_settings() -> PoolSettings {
    PoolSettings {
        min_pool_size: 0,
        max_pool_size: 1,
        reserve_size: 0,
        keep_alive: Duration::ZERO,
        verbose: false,
        charset: Default::default(),
    }
}

/// One instruction plus a closure deciding stdout completion; stderr never
/// completes a command in these scenarios.
struct LineCommand {
    instruction: String,
    predicate: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl LineCommand {
    fn new(instruction: impl Into<String>, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            instruction: instruction.into(),
            predicate: Box::new(predicate),
        }
    }
}

impl Command for LineCommand {
    fn instruction(&self) -> &str {
        &self.instruction
    }
    fn is_completed_stdout(&self, line: &str) -> bool {
        (self.predicate)(line)
    }
    fn is_completed_stderr(&self, _line: &str) -> bool {
        false
    }
}

/// A fixed command list, with lifecycle flags a test can assert on and a
/// cooperative cancel switch.
struct Script {
    commands: Vec<Box<dyn Command>>,
    terminate_afterwards: bool,
    started: AtomicBool,
    finished: AtomicBool,
    cancel: AtomicBool,
}

impl Script {
    fn new(commands: Vec<LineCommand>, terminate_afterwards: bool) -> Arc<Self> {
        Arc::new(Self {
            commands: commands
                .into_iter()
                .map(|c| Box::new(c) as Box<dyn Command>)
                .collect(),
            terminate_afterwards,
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        })
    }

    fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}

impl Submission for Script {
    fn commands(&self) -> &[Box<dyn Command>] {
        &self.commands
    }
    fn terminate_process_afterwards(&self) -> bool {
        self.terminate_afterwards
    }
    fn on_started_processing(&self) {
        self.started.store(true, Ordering::Release);
    }
    fn on_finished_processing(&self) {
        assert!(self.started.load(Ordering::Acquire), "I5: finished without having started");
        self.finished.store(true, Ordering::Release);
    }
    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// A handshaking `sh` repl: prints `hi` on startup, then for every line read
/// echoes it back followed by `done`; `exit 0` as a line terminates it
/// cleanly (used by the `terminate()` protocol below).
const HANDSHAKE_SCRIPT: &str =
    "echo hi; while IFS= read -r line; do [ \"$line\" = \"exit 0\" ] && exit 0; echo \"$line\"; echo done; done";

struct HandshakeManager;

#[async_trait]
impl ProcessManager for HandshakeManager {
    async fn start_process(&self) -> Result<TokioCommand, PoolError> {
        let mut command = TokioCommand::new("sh");
        command.arg("-c").arg(HANDSHAKE_SCRIPT);
        Ok(command)
    }

    fn starts_up_instantly(&self) -> bool {
        false
    }

    fn is_started_up(&self, line: &str, is_stdout: bool) -> bool {
        is_stdout && line == "hi"
    }

    async fn on_startup(&self, shell: ShellHandle) {
        let priming = Script::new(vec![LineCommand::new("init", |line| line == "done")], false);
        shell
            .execute(priming)
            .await
            .expect("priming submission should run against a freshly-ready shell");
    }

    async fn terminate(&self, shell: ShellHandle) -> bool {
        if shell.write_instruction("exit 0").await.is_err() {
            return false;
        }
        matches!(
            tokio::time::timeout(Duration::from_millis(500), shell.next_stdout_line()).await,
            Ok(None)
        )
    }

    async fn on_termination(&self, _exit_code: Option<i32>) {}
}

struct HandshakeFactory;
impl ProcessManagerFactory for HandshakeFactory {
    fn new_process_manager(&self) -> Box<dyn ProcessManager> {
        Box::new(HandshakeManager)
    }
}

/// Same handshake, but the child never reacts to `exit 0` (it just echoes it
/// like any other line) -- used to exercise the force-kill path.
const STUBBORN_SCRIPT: &str = "echo hi; while IFS= read -r line; do echo \"$line\"; echo done; done";

struct StubbornManager;

#[async_trait]
impl ProcessManager for StubbornManager {
    async fn start_process(&self) -> Result<TokioCommand, PoolError> {
        let mut command = TokioCommand::new("sh");
        command.arg("-c").arg(STUBBORN_SCRIPT);
        Ok(command)
    }
    fn starts_up_instantly(&self) -> bool {
        false
    }
    fn is_started_up(&self, line: &str, is_stdout: bool) -> bool {
        is_stdout && line == "hi"
    }
    async fn on_startup(&self, _shell: ShellHandle) {}
    async fn terminate(&self, shell: ShellHandle) -> bool {
        if shell.write_instruction("exit 0").await.is_err() {
            return false;
        }
        // Expects to see "bye" within the grace window; the stubborn child
        // never sends it, so this always times out and the pool force-kills.
        matches!(
            tokio::time::timeout(Duration::from_millis(200), async {
                loop {
                    match shell.next_stdout_line().await {
                        Some(line) if line == "bye" => return true,
                        Some(_) => continue,
                        None => return false,
                    }
                }
            })
            .await,
            Ok(true)
        )
    }
    async fn on_termination(&self, _exit_code: Option<i32>) {}
}

struct StubbornFactory;
impl ProcessManagerFactory for StubbornFactory {
    fn new_process_manager(&self) -> Box<dyn ProcessManager> {
        Box::new(StubbornManager)
    }
}

async fn wait_until_shell_count(pool: &ProcessPool, expected: usize, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pool.shell_count() == expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("shell_count did not reach {expected} within {timeout:?} (was {})", pool.shell_count());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// S1 -- start + prime + execute: the handshake, the priming submission run
/// from `on_startup`, and a client submission all succeed, and the shell
/// ends up `READY` again afterwards.
#[tokio::test]
async fn s1_start_prime_and_execute() {
    let pool = ProcessPool::new(Arc::new(HandshakeFactory), default_settings())
        .await
        .unwrap();
    assert_eq!(pool.shell_count(), 1);

    let script = Script::new(vec![LineCommand::new("ping", |line| line == "done")], false);
    let handle = pool.submit(script.clone()).unwrap();
    handle.wait().await.unwrap();

    assert!(script.finished.load(Ordering::Acquire));
    assert_eq!(pool.shell_count(), 1, "shell should stay pooled, not be torn down");

    pool.shutdown().await;
}

/// S2 -- terminate-after: an orderly `terminate()` is observed and the shell
/// is reaped; the pool can replace it if sizing calls for it.
#[tokio::test]
async fn s2_terminate_after_submission() {
    let pool = ProcessPool::new(Arc::new(HandshakeFactory), default_settings())
        .await
        .unwrap();

    let script = Script::new(vec![LineCommand::new("ping", |line| line == "done")], true);
    let handle = pool.submit(script).unwrap();
    handle.wait().await.unwrap();

    wait_until_shell_count(&pool, 0, Duration::from_secs(2)).await;
    pool.shutdown().await;
}

/// S3 -- force kill: the child never acknowledges `terminate()`, so the pool
/// falls back to killing it; the shell is still reaped and removed.
#[tokio::test]
async fn s3_force_kill_on_unresponsive_terminate() {
    let pool = ProcessPool::new(Arc::new(StubbornFactory), default_settings())
        .await
        .unwrap();

    let script = Script::new(vec![LineCommand::new("ping", |line| line == "done")], true);
    let handle = pool.submit(script).unwrap();
    handle.wait().await.unwrap();

    wait_until_shell_count(&pool, 0, Duration::from_secs(2)).await;
    pool.shutdown().await;
}

/// S4 -- idle timeout: a shell with no work for `keepAliveMs` terminates
/// itself and the pool shrinks back to zero.
#[tokio::test]
async fn s4_idle_timeout_shrinks_pool_to_zero() {
    let settings = PoolSettings {
        min_pool_size: 0,
        max_pool_size: 2,
        reserve_size: 0,
        keep_alive: Duration::from_millis(150),
        verbose: false,
        charset: Default::default(),
    };
    let pool = ProcessPool::new(Arc::new(ShManagerFactory::default()), settings)
        .await
        .unwrap();
    assert_eq!(pool.shell_count(), 0);

    let handle = pool.submit(Arc::new(ShellScript::new(vec!["true".to_string()]))).unwrap();
    handle.wait().await.unwrap();
    assert_eq!(pool.shell_count(), 1);

    wait_until_shell_count(&pool, 0, Duration::from_secs(2)).await;
    pool.shutdown().await;
}

/// S5 -- burst: many submissions arrive at once; the pool grows up to
/// `maxPoolSize` and every submission eventually completes.
#[tokio::test]
async fn s5_burst_of_submissions_all_complete_within_max_pool_size() {
    let settings = PoolSettings {
        min_pool_size: 2,
        max_pool_size: 10,
        reserve_size: 3,
        keep_alive: Duration::ZERO,
        verbose: false,
        charset: Default::default(),
    };
    let pool = ProcessPool::new(Arc::new(ShManagerFactory::default()), settings)
        .await
        .unwrap();
    assert_eq!(pool.shell_count(), 5); // max(min, reserve) = max(2, 3)

    let handles: Vec<_> = (0..30)
        .map(|_| pool.submit(Arc::new(ShellScript::new(vec!["sleep 0.05".to_string()]))).unwrap())
        .collect();

    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert!(pool.shell_count() <= 10, "I1: pool grew past max_pool_size");

    pool.shutdown().await;
}

/// S6 -- cancel while queued: with the pool saturated, a freshly-submitted
/// submission can be cancelled before a shell ever picks it up.
#[tokio::test]
async fn s6_cancel_while_queued_never_executes() {
    let settings = PoolSettings {
        min_pool_size: 1,
        max_pool_size: 1,
        reserve_size: 0,
        keep_alive: Duration::ZERO,
        verbose: false,
        charset: Default::default(),
    };
    let pool = ProcessPool::new(Arc::new(ShManagerFactory::default()), settings)
        .await
        .unwrap();

    // Occupy the only shell for long enough to queue behind it.
    let _busy = pool.submit(Arc::new(ShellScript::new(vec!["sleep 1".to_string()]))).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let queued = Script::new(vec![LineCommand::new("ping", |line| line == "done")], false);
    let handle = pool.submit(queued.clone()).unwrap();
    assert!(handle.cancel(true));
    assert!(handle.is_cancelled());

    let outcome = handle.wait().await;
    assert!(matches!(outcome, Err(PoolError::Cancelled)));
    assert!(!queued.started.load(Ordering::Acquire), "a cancelled, still-queued submission must never start");

    pool.shutdown().await;
}
