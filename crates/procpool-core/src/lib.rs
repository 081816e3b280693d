//! A pool of long-lived, interactive child processes dispatched over a
//! line-oriented stdio protocol.
//!
//! The pool owns nothing about what a child process *speaks*: callers
//! supply a [`ProcessManagerFactory`] (how to spawn and recognize startup/
//! shutdown for one shell), and [`Submission`]/[`Command`] implementations
//! (what to write to a shell's stdin and how to recognize each command's
//! response). The pool's job is sizing, dispatch, cancellation, and
//! lifecycle -- never protocol semantics.
//!
//! ```ignore
//! let pool = ProcessPool::new(factory, settings).await?;
//! let handle = pool.submit(Arc::new(my_submission))?;
//! let elapsed = handle.wait().await?;
//! pool.shutdown().await;
//! ```

mod charset;
mod command;
mod error;
mod manager;
mod pool;
mod pump;
mod settings;
mod shell;
mod submission;

pub use charset::Charset;
pub use command::Command;
pub use error::PoolError;
pub use manager::{ProcessManager, ProcessManagerFactory};
pub use pool::ProcessPool;
pub use settings::PoolSettings;
pub use shell::{ShellHandle, ShellId, ShellState};
pub use submission::{Submission, SubmissionHandle};
