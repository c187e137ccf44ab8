#![allow(unsafe_code)]
//! Process-group invoker backed by `tokio::process`.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{InvokeError, InvokeResult, Invoker, SharedBuffer};

/// Default interval at which [`InvokeResult::wait_for`] polls stdout.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

type ExitOutcome = Option<Result<ExitStatus, String>>;

/// [`Invoker`] that starts every command in a fresh process group.
#[derive(Debug, Clone)]
pub struct ProcessGroupInvoker {
    poll_interval: Duration,
}

impl Default for ProcessGroupInvoker {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ProcessGroupInvoker {
    /// Create an invoker with the default poll interval.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how often `wait_for` checks stdout for its marker.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Invoker for ProcessGroupInvoker {
    fn invoke(
        &self,
        ctx: &CancellationToken,
        program: &str,
        args: &[String],
        env: &[String],
    ) -> Box<dyn InvokeResult> {
        tracing::debug!(program, ?args, "Invoking command in new process group");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for var in env {
            if let Some((key, value)) = var.split_once('=') {
                cmd.env(key, value);
            }
        }

        let stdout = SharedBuffer::new();
        let stderr = SharedBuffer::new();

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(program, error = %e, "Command failed to start");
                return Box::new(ProcessResult {
                    program: program.to_string(),
                    pid: None,
                    stdout,
                    stderr,
                    exit: None,
                    spawn_error: Some(InvokeError::Spawn {
                        program: program.to_string(),
                        message: e.to_string(),
                    }),
                    done: Arc::new(AtomicBool::new(true)),
                    poll_interval: self.poll_interval,
                });
            }
        };

        let mut drains = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            let buf = stdout.clone();
            drains.push(tokio::spawn(async move { buf.drain_from(out).await }));
        }
        if let Some(err) = child.stderr.take() {
            let buf = stderr.clone();
            drains.push(tokio::spawn(async move { buf.drain_from(err).await }));
        }

        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel::<ExitOutcome>(None);
        tokio::spawn(async move {
            let outcome = child.wait().await.map_err(|e| e.to_string());
            // Output is complete before the exit is published.
            for drain in drains {
                let _ = drain.await;
            }
            exit_tx.send_replace(Some(outcome));
        });

        let done = Arc::new(AtomicBool::new(false));
        spawn_cancel_watcher(
            ctx.clone(),
            program.to_string(),
            pid,
            exit_rx.clone(),
            Arc::clone(&done),
        );

        Box::new(ProcessResult {
            program: program.to_string(),
            pid,
            stdout,
            stderr,
            exit: Some(exit_rx),
            spawn_error: None,
            done,
            poll_interval: self.poll_interval,
        })
    }
}

fn spawn_cancel_watcher(
    ctx: CancellationToken,
    program: String,
    pid: Option<u32>,
    mut exit: watch::Receiver<ExitOutcome>,
    done: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            () = async { let _ = exit.wait_for(Option::is_some).await; } => {}
            () = ctx.cancelled() => {
                if done.load(Ordering::SeqCst) || exit.borrow().is_some() {
                    tracing::debug!(%program, "Not killing process, already finished");
                    return;
                }
                tracing::info!(%program, ?pid, "Cancelled, killing process group");
                kill_process_group(pid);
                // The reaper task collects the exit status.
                let _ = exit.wait_for(Option::is_some).await;
            }
        }
    });
}

/// Send SIGKILL to every process in the group led by `pid`.
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };

    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::info!(
            pgid,
            error = %std::io::Error::last_os_error(),
            "Failed to kill process group"
        );
    }
}

fn exit_result(outcome: &Result<ExitStatus, String>) -> Result<(), InvokeError> {
    let status = outcome.as_ref().map_err(|e| InvokeError::Wait(e.clone()))?;
    if status.success() {
        Ok(())
    } else if let Some(code) = status.code() {
        Err(InvokeError::Exited { code })
    } else if let Some(signal) = status.signal() {
        Err(InvokeError::Signaled {
            signal: signal_name(signal),
        })
    } else {
        Err(InvokeError::Wait(format!("unrecognised exit status {status}")))
    }
}

fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGKILL => "killed".to_string(),
        libc::SIGTERM => "terminated".to_string(),
        libc::SIGINT => "interrupt".to_string(),
        other => other.to_string(),
    }
}

struct ProcessResult {
    program: String,
    pid: Option<u32>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    exit: Option<watch::Receiver<ExitOutcome>>,
    spawn_error: Option<InvokeError>,
    done: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl ProcessResult {
    fn exit_receiver(&self) -> Result<watch::Receiver<ExitOutcome>, InvokeError> {
        match (&self.spawn_error, &self.exit) {
            (Some(err), _) => Err(err.clone()),
            (None, Some(rx)) => Ok(rx.clone()),
            (None, None) => Err(InvokeError::Wait("process was never started".to_string())),
        }
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl InvokeResult for ProcessResult {
    fn stdout(&self) -> String {
        self.stdout.to_string()
    }

    fn stderr(&self) -> String {
        self.stderr.to_string()
    }

    async fn wait(&self) -> Result<(), InvokeError> {
        let mut exit = self.exit_receiver()?;
        let outcome = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|e| InvokeError::Wait(e.to_string()))?
            .clone();
        self.mark_done();

        match outcome {
            Some(outcome) => exit_result(&outcome),
            None => Err(InvokeError::Wait("missing exit status".to_string())),
        }
    }

    async fn wait_for(&self, marker: &str, timeout: Duration) -> Result<(), InvokeError> {
        let mut exit = self.exit_receiver()?;
        let deadline = Instant::now() + timeout;

        loop {
            let finished = exit.borrow().clone();
            if let Some(outcome) = finished {
                self.mark_done();
                exit_result(&outcome)?;
                return if self.stdout.contains(marker) {
                    Ok(())
                } else {
                    Err(InvokeError::MissingOutput)
                };
            }

            if self.stdout.contains(marker) {
                self.mark_done();
                return Ok(());
            }

            if Instant::now() >= deadline {
                tracing::info!(program = %self.program, "Timed out waiting for output, killing");
                kill_process_group(self.pid);
                return Err(InvokeError::TimedOut);
            }

            let mut closed = false;
            tokio::select! {
                biased;
                changed = exit.changed() => closed = changed.is_err(),
                () = tokio::time::sleep_until(deadline) => {}
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            if closed && exit.borrow().is_none() {
                return Err(InvokeError::Wait("process reaper exited".to_string()));
            }
        }
    }
}
