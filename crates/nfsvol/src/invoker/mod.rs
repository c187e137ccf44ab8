//! External command invocation.
//!
//! Commands run as the leader of their own process group so that anything
//! they fork (mount helpers in particular) can be killed as a unit. A launch
//! never blocks; callers decide whether to wait for exit or for a marker on
//! stdout.

mod buffer;
mod pgroup;

use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use buffer::SharedBuffer;
pub use pgroup::ProcessGroupInvoker;

/// Failures observed while running an external command.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The command could not be started.
    #[error("failed to start {program}: {message}")]
    #[diagnostic(code(nfsvol::invoke::spawn))]
    Spawn {
        /// The program that failed to launch.
        program: String,
        /// The launch failure.
        message: String,
    },

    /// The command exited with a non-zero status.
    #[error("exit status {code}")]
    #[diagnostic(code(nfsvol::invoke::exit))]
    Exited {
        /// The exit code.
        code: i32,
    },

    /// The command was terminated by a signal.
    #[error("signal: {signal}")]
    #[diagnostic(code(nfsvol::invoke::signal))]
    Signaled {
        /// The signal description.
        signal: String,
    },

    /// The command exited cleanly without printing the expected marker.
    #[error("command finished without expected text")]
    #[diagnostic(code(nfsvol::invoke::missing_output))]
    MissingOutput,

    /// The marker did not appear before the deadline.
    #[error("command timed out")]
    #[diagnostic(code(nfsvol::invoke::timeout))]
    TimedOut,

    /// Waiting on the process failed.
    #[error("wait failed: {0}")]
    #[diagnostic(code(nfsvol::invoke::wait))]
    Wait(String),
}

/// Handle to a launched command.
#[async_trait]
pub trait InvokeResult: Send + Sync {
    /// Everything the command has written to stdout so far.
    fn stdout(&self) -> String;

    /// Everything the command has written to stderr so far.
    fn stderr(&self) -> String;

    /// Block until the command exits.
    ///
    /// # Errors
    ///
    /// Returns the launch error, or the command's failing exit status.
    async fn wait(&self) -> Result<(), InvokeError>;

    /// Block until `marker` shows up on stdout, the command exits, or
    /// `timeout` elapses.
    ///
    /// A command that exits with an error reports that error; a clean exit
    /// without the marker is [`InvokeError::MissingOutput`]; the marker
    /// showing up first is success and detaches the command from its
    /// cancellation watcher; the deadline passing first kills the process
    /// group and reports [`InvokeError::TimedOut`].
    ///
    /// # Errors
    ///
    /// See above.
    async fn wait_for(&self, marker: &str, timeout: Duration) -> Result<(), InvokeError>;
}

/// Launches external commands.
pub trait Invoker: Send + Sync {
    /// Start `program` with `args` and extra `KEY=VALUE` environment entries.
    ///
    /// If `ctx` is cancelled before the command completes, the whole process
    /// group is killed.
    fn invoke(
        &self,
        ctx: &CancellationToken,
        program: &str,
        args: &[String],
        env: &[String],
    ) -> Box<dyn InvokeResult>;
}

/// Build an argument vector from string slices.
#[must_use]
pub fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}
