//! The uniform contract every command is executed through.
//!
//! Dispatching an operation yields an [`AsyncUnit`]: a deferred invocation
//! that does nothing until the pipeline invokes it. Invoking it yields a
//! [`Task`], whose output streams and progress channel the pipeline drains
//! while awaiting its completion signal.
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::command::Command;
use crate::error::{PipelineError, Result};
use crate::write::BurnProgress;

/// A source of raw output bytes.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// How a task reports that it finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// The primitive reported it is done.
    Done,
    /// The output stream ended.
    End,
    /// A child process exited with this code.
    Exit(i32),
}

impl Signal {
    /// Maps a completion signal onto success or failure. Only a non-zero exit
    /// code fails.
    pub fn settle(self) -> Result<()> {
        match self {
            Signal::Done | Signal::End | Signal::Exit(0) => Ok(()),
            Signal::Exit(code) => Err(PipelineError::ExitCode(code)),
        }
    }
}

/// A running operation.
pub struct Task {
    pub stdout: Option<ByteSource>,
    pub stderr: Option<ByteSource>,
    pub progress: Option<mpsc::UnboundedReceiver<BurnProgress>>,
    pub completion: BoxFuture<'static, Result<Signal>>,
}

impl Task {
    pub fn new<F>(completion: F) -> Self
    where
        F: Future<Output = Result<Signal>> + Send + 'static,
    {
        Self {
            stdout: None,
            stderr: None,
            progress: None,
            completion: completion.boxed(),
        }
    }

    pub fn with_stdout(mut self, stdout: ByteSource) -> Self {
        self.stdout = Some(stdout);
        self
    }

    pub fn with_stderr(mut self, stderr: ByteSource) -> Self {
        self.stderr = Some(stderr);
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedReceiver<BurnProgress>) -> Self {
        self.progress = Some(progress);
        self
    }
}

type Invocation = Box<dyn FnOnce() -> BoxFuture<'static, Result<Task>> + Send>;

/// A bound, not yet executed, operation.
pub struct AsyncUnit {
    command: Command,
    invoke: Invocation,
}

impl AsyncUnit {
    pub fn new<F, Fut>(command: Command, invoke: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Task>> + Send + 'static,
    {
        Self {
            command,
            invoke: Box::new(move || invoke().boxed()),
        }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    /// Starts the operation. Consumes the unit, so it runs at most once.
    pub async fn invoke(self) -> Result<Task> {
        (self.invoke)().await
    }
}

/// Runs a synchronous primitive on tokio's blocking pool.
pub(crate) async fn blocking<F>(job: F) -> Result<()>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| PipelineError::Execution(anyhow::anyhow!("Worker thread failed: {e}")))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn only_nonzero_exit_codes_fail() {
        assert!(Signal::Done.settle().is_ok());
        assert!(Signal::End.settle().is_ok());
        assert!(Signal::Exit(0).settle().is_ok());
        assert!(matches!(
            Signal::Exit(2).settle(),
            Err(PipelineError::ExitCode(2))
        ));
    }

    #[tokio::test]
    async fn binding_a_unit_does_not_run_it() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let unit = AsyncUnit::new(Command::Copy, move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(Task::new(async { Ok(Signal::Done) }))
        });

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(unit.command(), Command::Copy);

        let task = unit.invoke().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(task.completion.await.unwrap(), Signal::Done);
    }

    #[tokio::test]
    async fn blocking_errors_propagate() {
        let err = blocking(|| Err(anyhow::anyhow!("disk on fire"))).await.unwrap_err();
        assert_eq!(err.to_string(), "disk on fire");
    }
}
