//! A `ProcessManager` for plain POSIX shells (`/bin/sh` by default).
//!
//! `sh` has no handshake of its own, so the manager reports
//! [`ProcessManager::starts_up_instantly`] and skips the `STARTING` line
//! wait entirely. Orderly shutdown writes `exit` and waits (briefly) for
//! the child to close its streams before the pool falls back to a signal.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as TokioCommand;

use procpool_core::{PoolError, ProcessManager, ProcessManagerFactory, ShellHandle};

const TERMINATE_GRACE: Duration = Duration::from_millis(500);

pub struct ShManagerFactory {
    shell_path: String,
}

impl ShManagerFactory {
    pub fn new(shell_path: impl Into<String>) -> Self {
        Self {
            shell_path: shell_path.into(),
        }
    }
}

impl Default for ShManagerFactory {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

impl ProcessManagerFactory for ShManagerFactory {
    fn new_process_manager(&self) -> Box<dyn ProcessManager> {
        Box::new(ShManager {
            shell_path: self.shell_path.clone(),
        })
    }
}

struct ShManager {
    shell_path: String,
}

#[async_trait]
impl ProcessManager for ShManager {
    async fn start_process(&self) -> Result<TokioCommand, PoolError> {
        Ok(TokioCommand::new(&self.shell_path))
    }

    fn starts_up_instantly(&self) -> bool {
        true
    }

    fn is_started_up(&self, _line: &str, _is_stdout: bool) -> bool {
        unreachable!("starts_up_instantly() is true, so this is never consulted")
    }

    async fn on_startup(&self, _shell: ShellHandle) {
        tracing::debug!("shell ready, no priming commands configured");
    }

    async fn terminate(&self, shell: ShellHandle) -> bool {
        if shell.write_instruction("exit").await.is_err() {
            return false;
        }

        let closed = tokio::time::timeout(TERMINATE_GRACE, async {
            loop {
                if shell.next_stdout_line().await.is_none() {
                    return;
                }
            }
        })
        .await;

        closed.is_ok()
    }

    async fn on_termination(&self, exit_code: Option<i32>) {
        tracing::debug!(?exit_code, "shell terminated");
    }
}
