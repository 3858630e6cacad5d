//! The pipeline executor.
//!
//! A run validates its options, filters the operation list, then executes
//! the surviving operations strictly one at a time. Step `i + 1` never starts
//! before step `i` has signalled completion and all of its output has been
//! drained, so output from different steps never interleaves.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{self, Context};
use crate::condition::{filter_by_options, missing_options};
use crate::error::{PipelineError, Result};
use crate::event::{Emitter, Event, EventStream, State, percentage};
use crate::image::ImageFs;
use crate::operation::Operation;
use crate::options::{Options, with_defaults};
use crate::task::{ByteSource, Task};
use crate::write::{BurnProgress, DriveWriter};

const READ_CHUNK: usize = 8192;

/// The operations a run will execute, and the options it runs with.
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    pub options: Options,
    pub operations: Vec<Operation>,
}

/// Builder for a pipeline run over one image.
pub struct Pipeline {
    image: PathBuf,
    operations: Vec<Operation>,
    options: Options,
    context: Context,
}

impl Pipeline {
    pub fn new(image: impl Into<PathBuf>, operations: Vec<Operation>) -> Self {
        Self {
            image: image.into(),
            operations,
            options: Options::new(),
            context: Context::default(),
        }
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn image_fs(mut self, image_fs: Arc<dyn ImageFs>) -> Self {
        self.context.image_fs = image_fs;
        self
    }

    pub fn drive_writer(mut self, drive_writer: Arc<dyn DriveWriter>) -> Self {
        self.context.drive_writer = drive_writer;
        self
    }

    /// Cancelling this token stops the run: no further step starts, a running
    /// script is killed and a burn stops between chunks.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.context.cancel = cancel;
        self
    }

    /// Computes the effective options and the operations that apply to them.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingOptions`] if any `when` clause names
    /// an option that was not supplied.
    pub fn plan(&self) -> Result<Plan> {
        let options = with_defaults(&self.options);

        let missing = missing_options(&self.operations, &options);
        if !missing.is_empty() {
            return Err(PipelineError::MissingOptions(missing));
        }

        let operations = filter_by_options(&self.operations, &options);
        Ok(Plan {
            options,
            operations,
        })
    }

    /// Validates the run and starts it on the current Tokio runtime.
    ///
    /// Configuration errors are returned here, before any event is
    /// published. Everything after that, including failures, is reported
    /// through the returned [`EventStream`].
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn execute(self) -> Result<EventStream> {
        let Plan {
            options,
            operations,
        } = self.plan()?;

        let (emitter, stream) = EventStream::channel();
        let run = Run {
            image: self.image,
            operations,
            options,
            context: self.context,
        };
        tokio::spawn(run.drive(emitter));

        Ok(stream)
    }
}

/// Runs `operations` against `image` with the default collaborators.
///
/// See [`Pipeline::execute`].
pub fn execute(
    image: impl Into<PathBuf>,
    operations: Vec<Operation>,
    options: Options,
) -> Result<EventStream> {
    Pipeline::new(image, operations).options(options).execute()
}

struct Run {
    image: PathBuf,
    operations: Vec<Operation>,
    options: Options,
    context: Context,
}

impl Run {
    async fn drive(self, emitter: Emitter) {
        info!(
            image = %self.image.display(),
            "starting pipeline with {} operation(s)",
            self.operations.len()
        );

        let result = self.run_steps(&emitter).await;
        match &result {
            Ok(()) => info!("pipeline completed successfully"),
            Err(e) => warn!(error = %e, "pipeline failed"),
        }

        emitter.finish(result);
    }

    async fn run_steps(&self, emitter: &Emitter) -> Result<()> {
        let total = self.operations.len();

        for (index, operation) in self.operations.iter().enumerate() {
            if self.context.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            emitter.emit(Event::State(State {
                operation: operation.clone(),
                percentage: percentage(index, total),
            }));
            debug!(
                step = index + 1,
                total,
                command = operation.action.command(),
                "running operation"
            );

            let unit = command::dispatch(&self.image, operation, &self.options, &self.context)?;
            let task = unit.invoke().await?;
            drain(task, emitter).await?;
        }

        Ok(())
    }
}

/// Awaits a task's completion signal while republishing its output and
/// progress. Returns once the signal has resolved and every stream is closed.
async fn drain(task: Task, emitter: &Emitter) -> Result<()> {
    let Task {
        stdout,
        stderr,
        progress,
        completion,
    } = task;

    let (signal, stdout, stderr, ()) = tokio::join!(
        completion,
        forward_output(stdout, emitter, Event::Stdout),
        forward_output(stderr, emitter, Event::Stderr),
        forward_progress(progress, emitter),
    );

    let signal = signal?;
    stdout?;
    stderr?;
    signal.settle()
}

async fn forward_output(
    source: Option<ByteSource>,
    emitter: &Emitter,
    wrap: fn(Vec<u8>) -> Event,
) -> Result<()> {
    let Some(mut source) = source else {
        return Ok(());
    };

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        emitter.emit(wrap(buf[..n].to_vec()));
    }
}

async fn forward_progress(
    progress: Option<mpsc::UnboundedReceiver<BurnProgress>>,
    emitter: &Emitter,
) {
    if let Some(mut progress) = progress {
        while let Some(report) = progress.recv().await {
            emitter.emit(Event::Burn(report));
        }
    }
}

/// Renders a plan as a numbered list of steps with their progress marks.
pub fn describe(image: &Path, plan: &Plan) -> String {
    let mut out = format!("{} operation(s) on {}", plan.operations.len(), image.display());
    for (index, operation) in plan.operations.iter().enumerate() {
        out.push_str(&format!(
            "\n  [{:>5.1}%] {}",
            percentage(index, plan.operations.len()),
            operation
        ));
    }
    out
}
