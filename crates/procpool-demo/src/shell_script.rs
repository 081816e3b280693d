//! `Command`/`Submission` implementations for running a list of shell lines
//! and capturing what each one printed to stdout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use procpool_core::{Command, Submission};

static NEXT_MARKER: AtomicU64 = AtomicU64::new(0);

fn next_marker() -> String {
    format!("__procpool_done_{}__", NEXT_MARKER.fetch_add(1, Ordering::Relaxed))
}

/// One shell line, with its own unique completion marker appended so the
/// pool can tell where its output ends. Captures every stdout line it sees
/// before the marker for the caller to inspect afterwards.
pub struct ShellCommand {
    instruction: String,
    marker: String,
    captured: StdMutex<Vec<String>>,
}

impl ShellCommand {
    pub fn new(line: impl AsRef<str>) -> Self {
        let marker = next_marker();
        let instruction = format!("{} ; echo {marker}", line.as_ref());
        Self {
            instruction,
            marker,
            captured: StdMutex::new(Vec::new()),
        }
    }

    pub fn captured_output(&self) -> Vec<String> {
        self.captured.lock().unwrap().clone()
    }
}

impl Command for ShellCommand {
    fn instruction(&self) -> &str {
        &self.instruction
    }

    fn is_completed_stdout(&self, line: &str) -> bool {
        if line == self.marker {
            true
        } else {
            self.captured.lock().unwrap().push(line.to_string());
            false
        }
    }

    fn is_completed_stderr(&self, _line: &str) -> bool {
        false
    }
}

/// Delegating impl so an `Arc<ShellCommand>` can be boxed into a
/// `Submission`'s command list while the same `Arc` stays around for the
/// caller to read `captured_output()` back out after the submission finishes.
impl Command for Arc<ShellCommand> {
    fn instruction(&self) -> &str {
        ShellCommand::instruction(self)
    }

    fn is_completed_stdout(&self, line: &str) -> bool {
        ShellCommand::is_completed_stdout(self, line)
    }

    fn is_completed_stderr(&self, line: &str) -> bool {
        ShellCommand::is_completed_stderr(self, line)
    }
}

/// An ordered list of shell lines run against one shell in a single
/// submission, optionally terminating that shell once the last one finishes.
pub struct ShellScript {
    commands: Vec<Box<dyn Command>>,
    handles: Vec<Arc<ShellCommand>>,
    terminate_afterwards: bool,
}

impl ShellScript {
    pub fn new(lines: impl IntoIterator<Item = String>) -> Self {
        let handles: Vec<Arc<ShellCommand>> = lines
            .into_iter()
            .map(|line| Arc::new(ShellCommand::new(line)))
            .collect();
        let commands = handles
            .iter()
            .map(|handle| Box::new(handle.clone()) as Box<dyn Command>)
            .collect();
        Self {
            commands,
            handles,
            terminate_afterwards: false,
        }
    }

    /// Mark this script's shell for termination once it finishes running.
    pub fn terminating(mut self) -> Self {
        self.terminate_afterwards = true;
        self
    }

    /// Every stdout line captured by every command, in script order, once
    /// the submission this script belongs to has completed.
    pub fn commands_captured_output(&self) -> Vec<String> {
        self.handles
            .iter()
            .flat_map(|handle| handle.captured_output())
            .collect()
    }
}

impl Submission for ShellScript {
    fn commands(&self) -> &[Box<dyn Command>] {
        &self.commands
    }

    fn terminate_process_afterwards(&self) -> bool {
        self.terminate_afterwards
    }
}
