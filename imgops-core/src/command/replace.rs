//! Find and replace inside a file of the image.
use super::Context;
use crate::error::Result;
use crate::operation::ResolvedFile;
use crate::task::{Signal, Task, blocking};

pub(super) async fn run(
    file: ResolvedFile,
    find: String,
    replace: String,
    context: Context,
) -> Result<Task> {
    let fs = context.image_fs;
    Ok(Task::new(async move {
        blocking(move || fs.replace_in_file(&file, &find, &replace)).await?;
        Ok(Signal::Done)
    }))
}
