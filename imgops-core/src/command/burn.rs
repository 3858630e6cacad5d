//! Writes the pipeline's image to the drive named by the `drive` option.
use anyhow::anyhow;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::Context;
use crate::error::{PipelineError, Result};
use crate::options::{DRIVE_OPTION, Options};
use crate::task::{Signal, Task};
use crate::write::{BurnProgress, ImageStream, is_compressed};

/// Extracts the target drive from the options.
fn drive_option(options: &Options) -> Result<PathBuf> {
    let value = options
        .get(DRIVE_OPTION)
        .ok_or_else(|| PipelineError::MissingOption(DRIVE_OPTION.to_string()))?;

    value
        .as_str()
        .map(PathBuf::from)
        .ok_or_else(|| PipelineError::InvalidOption {
            name: DRIVE_OPTION.to_string(),
            expected: "a device path".to_string(),
        })
}

pub(super) async fn run(
    image: PathBuf,
    verify: bool,
    options: Options,
    context: Context,
) -> Result<Task> {
    let drive = drive_option(&options)?;
    info!(
        image = %image.display(),
        drive = %drive.display(),
        verify,
        compressed = is_compressed(&image),
        "burning image"
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = context.drive_writer;
    let cancel = context.cancel;

    let job = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut on_progress = |progress: BurnProgress| {
            let _ = tx.send(progress);
        };

        let mut stream = ImageStream::open(&image, &cancel, &mut on_progress)?;
        let length = stream.attach_length()?;
        debug!(length, "image stream opened");

        writer.write_image(&drive, stream, verify, &cancel, &mut on_progress)
    });

    let task = Task::new(async move {
        job.await
            .map_err(|e| PipelineError::Execution(anyhow!("Burn worker failed: {e}")))??;
        Ok(Signal::End)
    });

    Ok(task.with_progress(rx))
}
