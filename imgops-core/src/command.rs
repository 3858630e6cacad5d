//! Maps operations onto the commands that execute them.
//!
//! The command set is closed: every [`Action`] variant has exactly one
//! handler, and binding an operation to its handler never runs it.
mod burn;
mod copy;
mod replace;
mod run_script;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};
use crate::image::{HostFs, ImageFs};
use crate::operation::{Action, Operation};
use crate::options::Options;
use crate::task::AsyncUnit;
use crate::write::{BlockDeviceWriter, DriveWriter};

/// The built-in commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Copy,
    Replace,
    RunScript,
    Burn,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::Copy,
        Command::Replace,
        Command::RunScript,
        Command::Burn,
    ];

    /// Looks a command up by its manifest name.
    pub fn resolve(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|command| command.name() == name)
            .ok_or_else(|| PipelineError::UnknownCommand(name.to_string()))
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Copy => "copy",
            Command::Replace => "replace",
            Command::RunScript => "run-script",
            Command::Burn => "burn",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Collaborators shared by every operation of a run.
#[derive(Clone)]
pub struct Context {
    pub image_fs: Arc<dyn ImageFs>,
    pub drive_writer: Arc<dyn DriveWriter>,
    pub cancel: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            image_fs: Arc::new(HostFs),
            drive_writer: Arc::new(BlockDeviceWriter),
            cancel: CancellationToken::new(),
        }
    }
}

/// Binds `operation` to its handler, producing a unit the pipeline invokes
/// later. File references without an image are resolved against `image`
/// here, as new values. Relative script paths are resolved against the image
/// when the script runs.
pub fn dispatch(
    image: &Path,
    operation: &Operation,
    options: &Options,
    context: &Context,
) -> Result<AsyncUnit> {
    let context = context.clone();

    let unit = match &operation.action {
        Action::Copy { from, to } => {
            let from = from.resolve(image);
            let to = to.resolve(image);
            AsyncUnit::new(Command::Copy, move || copy::run(from, to, context))
        }
        Action::Replace {
            file,
            find,
            replace,
        } => {
            let file = file.resolve(image);
            let find = find.clone();
            let replace = replace.clone();
            AsyncUnit::new(Command::Replace, move || {
                replace::run(file, find, replace, context)
            })
        }
        Action::RunScript { script, arguments } => {
            let image = image.to_path_buf();
            let script = script.clone();
            let arguments = arguments.clone();
            AsyncUnit::new(Command::RunScript, move || {
                run_script::run(image, script, arguments, context)
            })
        }
        Action::Burn { verify } => {
            let image = image.to_path_buf();
            let verify = *verify;
            let options = options.clone();
            AsyncUnit::new(Command::Burn, move || {
                burn::run(image, verify, options, context)
            })
        }
        Action::Unknown { command } => {
            return Err(PipelineError::UnknownCommand(command.clone()));
        }
    };

    Ok(unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn resolves_builtin_names() {
        for command in Command::ALL {
            assert_eq!(Command::resolve(command.name()).unwrap(), command);
        }
        assert_eq!(Command::resolve("run-script").unwrap(), Command::RunScript);

        let err = Command::resolve("format").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownCommand);
        assert_eq!(err.to_string(), "Unknown command: format");
    }

    #[test]
    fn dispatch_binds_without_running() {
        let op = Operation::new(Action::Burn { verify: true });
        // No drive option: the precondition is only checked once invoked.
        let unit = dispatch(
            Path::new("/nonexistent.img"),
            &op,
            &Options::new(),
            &Context::default(),
        )
        .unwrap();
        assert_eq!(unit.command(), Command::Burn);
    }

    #[test]
    fn dispatch_rejects_unknown_commands() {
        let op = Operation::new(Action::Unknown {
            command: "format".into(),
        });
        let err = dispatch(Path::new("os.img"), &op, &Options::new(), &Context::default())
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::UnknownCommand(ref name) if name == "format"));
    }
}
