//! The `ProcessManager` / `ProcessManagerFactory` client contract.
//!
//! A `ProcessManager` is the per-shell strategy object: it knows how to
//! spawn the child, how to recognize that it has finished starting up, how
//! to prime it with initial commands, and how to ask it to exit cleanly.
//! The pool drives a manager through exactly this lifecycle; it never
//! inspects the child's protocol itself.

use async_trait::async_trait;
use tokio::process::Command as TokioCommand;

use crate::error::PoolError;
use crate::shell::ShellHandle;

/// Per-shell lifecycle strategy supplied by the client.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Build the (not-yet-spawned) command for this shell's child. The
    /// shell takes care of piping stdin/stdout/stderr and spawning it.
    async fn start_process(&self) -> Result<TokioCommand, PoolError>;

    /// If `true`, the shell transitions straight to `READY` after spawn
    /// without waiting for a startup line on stdout/stderr.
    fn starts_up_instantly(&self) -> bool {
        false
    }

    /// Consulted once per pump line while the shell is `STARTING`. Returning
    /// `true` marks the child started up.
    fn is_started_up(&self, line: &str, is_stdout: bool) -> bool;

    /// Called exactly once, right after the shell enters `READY` for the
    /// first time. May call `shell.execute(...)` directly to prime the
    /// child with initial commands before it is exposed to the pool.
    async fn on_startup(&self, shell: ShellHandle);

    /// Attempt an orderly shutdown (typically writing an exit command and
    /// waiting to observe its effect). Return `true` if the child is
    /// believed to be exiting on its own; the pool force-kills otherwise.
    async fn terminate(&self, shell: ShellHandle) -> bool;

    /// Called exactly once, after the child has been reaped.
    async fn on_termination(&self, exit_code: Option<i32>);
}

/// Produces a fresh [`ProcessManager`] for each shell the pool spawns.
pub trait ProcessManagerFactory: Send + Sync {
    fn new_process_manager(&self) -> Box<dyn ProcessManager>;
}
