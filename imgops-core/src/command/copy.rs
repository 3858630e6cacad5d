//! Copies a file between partitions or images.
use tracing::debug;

use super::Context;
use crate::error::Result;
use crate::operation::ResolvedFile;
use crate::task::{Signal, Task, blocking};

pub(super) async fn run(from: ResolvedFile, to: ResolvedFile, context: Context) -> Result<Task> {
    let fs = context.image_fs;
    Ok(Task::new(async move {
        debug!(from = %from.path.display(), to = %to.path.display(), "copying file");
        blocking(move || fs.copy_file(&from, &to)).await?;
        Ok(Signal::Done)
    }))
}
