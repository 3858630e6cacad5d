//! Runs an executable script as a child process, exposing its output.
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::Context;
use crate::error::{PipelineError, Result};
use crate::task::{ByteSource, Signal, Task};

#[cfg(unix)]
async fn make_executable(script: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(script, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_script: &Path) -> Result<()> {
    Ok(())
}

/// Puts the script at the head of its own process group so that everything
/// it starts can be killed together.
#[cfg(unix)]
fn isolate(command: &mut Command) {
    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_command: &mut Command) {}

/// Kills the script and every process in its group.
#[cfg(unix)]
fn kill_group(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::other(format!("process id {pid} out of range")))?;

    // SAFETY: kill(2) has no memory-safety preconditions. The group id is the
    // script's own pid because it was spawned with process_group(0).
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

/// Directory relative scripts are looked up in: the image itself when it is
/// a directory tree, otherwise the directory holding the image file.
async fn image_root(image: &Path) -> PathBuf {
    match tokio::fs::metadata(image).await {
        Ok(meta) if meta.is_dir() => image.to_path_buf(),
        _ => image
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    }
}

pub(super) async fn run(
    image: PathBuf,
    script: PathBuf,
    arguments: Vec<String>,
    context: Context,
) -> Result<Task> {
    let root = image_root(&image).await;

    // Absolute, so that changing the working directory below does not
    // change which file is executed.
    let script = tokio::fs::canonicalize(root.join(&script)).await?;
    make_executable(&script).await?;

    let mut command = Command::new(&script);
    command
        .args(&arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if root == image {
        command.current_dir(&root);
    } else if let Some(dir) = script.parent() {
        command.current_dir(dir);
    }
    isolate(&mut command);

    debug!(script = %script.display(), ?arguments, "spawning script");
    let mut child = command.spawn()?;

    let stdout = child.stdout.take().map(|s| Box::new(s) as ByteSource);
    let stderr = child.stderr.take().map(|s| Box::new(s) as ByteSource);

    let cancel = context.cancel;
    let mut task = Task::new(async move {
        tokio::select! {
            status = child.wait() => match status?.code() {
                Some(code) => Ok(Signal::Exit(code)),
                None => Err(PipelineError::Terminated),
            },
            _ = cancel.cancelled() => {
                if let Err(e) = kill_group(&mut child) {
                    warn!(error = %e, "failed to kill script processes");
                }
                if let Err(e) = child.wait().await {
                    warn!(error = %e, "failed to reap cancelled script");
                }
                Err(PipelineError::Cancelled)
            }
        }
    });
    if let Some(stdout) = stdout {
        task = task.with_stdout(stdout);
    }
    if let Some(stderr) = stderr {
        task = task.with_stderr(stderr);
    }

    Ok(task)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn relative_scripts_resolve_against_the_image() {
        let dir = tempdir().unwrap();
        assert_eq!(image_root(dir.path()).await, dir.path());

        let image = dir.path().join("os.img");
        std::fs::write(&image, b"raw").unwrap();
        assert_eq!(image_root(&image).await, dir.path());
    }
}
