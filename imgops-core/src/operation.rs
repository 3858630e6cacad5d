//! Declarative operation records and their JSON form.
//!
//! An operation is one step of a manifest: a command with its payload plus an
//! optional `when` clause naming the option values it requires.
//!
//! ```json
//! [
//!   { "command": "copy",
//!     "from": { "partition": 1, "path": "/config.json" },
//!     "to": { "partition": { "primary": 4, "logical": 1 }, "path": "/config.json" } },
//!   { "command": "replace",
//!     "file": { "partition": 1, "path": "/config.txt" },
//!     "find": "#dtoverlay=", "replace": "dtoverlay=",
//!     "when": { "overlay": "on" } },
//!   { "command": "run-script", "script": "scripts/seal.sh", "arguments": ["--fast"] },
//!   { "command": "burn", "when": { "target": "sd" } }
//! ]
//! ```
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::command::Command;
use crate::options::Options;

/// A partition selector inside an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Partition {
    Primary(u32),
    Logical { primary: u32, logical: u32 },
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Primary(n) => write!(f, "{n}"),
            Partition::Logical { primary, logical } => write!(f, "{primary}.{logical}"),
        }
    }
}

/// A file inside an image, as written in a manifest.
///
/// `image` may be left out, in which case it refers to the image the
/// pipeline is running against.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct FileRef {
    #[serde(default)]
    pub image: Option<PathBuf>,
    #[serde(default)]
    pub partition: Option<Partition>,
    pub path: PathBuf,
}

impl FileRef {
    pub fn new(partition: Option<Partition>, path: impl Into<PathBuf>) -> Self {
        Self {
            image: None,
            partition,
            path: path.into(),
        }
    }

    /// Produces a fully specified file reference, using `image` when this
    /// reference does not name one. The operation itself is left untouched.
    pub fn resolve(&self, image: &Path) -> ResolvedFile {
        ResolvedFile {
            image: self.image.clone().unwrap_or_else(|| image.to_path_buf()),
            partition: self.partition,
            path: self.path.clone(),
        }
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(image) = &self.image {
            write!(f, "{}:", image.display())?;
        }
        if let Some(partition) = &self.partition {
            write!(f, "({partition})")?;
        }
        write!(f, "{}", self.path.display())
    }
}

/// A [`FileRef`] with its image filled in.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedFile {
    pub image: PathBuf,
    pub partition: Option<Partition>,
    pub path: PathBuf,
}

/// What an operation does.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Action {
    /// Copy a file between two locations, possibly across images.
    Copy { from: FileRef, to: FileRef },
    /// Replace every occurrence of `find` with `replace` inside a file.
    Replace {
        file: FileRef,
        find: String,
        replace: String,
    },
    /// Run an executable script with arguments.
    RunScript {
        script: PathBuf,
        #[serde(default)]
        arguments: Vec<String>,
    },
    /// Write the image to the drive named by the `drive` option.
    Burn {
        #[serde(default = "default_verify")]
        verify: bool,
    },
    /// A command name this crate does not know. Kept so the failure is
    /// reported when the step is reached rather than at load time.
    #[serde(skip)]
    Unknown { command: String },
}

fn default_verify() -> bool {
    true
}

impl Action {
    /// The command name as it appears in manifests.
    pub fn command(&self) -> &str {
        match self {
            Action::Copy { .. } => "copy",
            Action::Replace { .. } => "replace",
            Action::RunScript { .. } => "run-script",
            Action::Burn { .. } => "burn",
            Action::Unknown { command } => command,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Copy { from, to } => write!(f, "copy {from} -> {to}"),
            Action::Replace { file, find, replace } => {
                write!(f, "replace {find:?} with {replace:?} in {file}")
            }
            Action::RunScript { script, arguments } => {
                write!(f, "run-script {}", script.display())?;
                for arg in arguments {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
            Action::Burn { .. } => f.write_str("burn"),
            Action::Unknown { command } => f.write_str(command),
        }
    }
}

/// One declarative step of a pipeline.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "RawOperation")]
pub struct Operation {
    pub action: Action,
    /// Option values this operation requires. Empty means it always applies.
    pub when: Options,
}

impl Operation {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            when: Options::new(),
        }
    }

    pub fn when(mut self, when: Options) -> Self {
        self.when = when;
        self
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.action.fmt(f)
    }
}

#[derive(Deserialize)]
struct RawOperation {
    command: String,
    #[serde(default)]
    when: Option<Options>,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl TryFrom<RawOperation> for Operation {
    type Error = serde_json::Error;

    fn try_from(raw: RawOperation) -> Result<Self, Self::Error> {
        let action = if Command::resolve(&raw.command).is_ok() {
            let mut payload = raw.payload;
            payload.insert("command".to_string(), Value::String(raw.command));
            serde_json::from_value(Value::Object(payload))?
        } else {
            Action::Unknown {
                command: raw.command,
            }
        };

        Ok(Operation {
            action,
            when: raw.when.unwrap_or_default(),
        })
    }
}

/// A list of operations as loaded from a manifest file: either a bare array
/// or an object with an `operations` array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Manifest {
    List(Vec<Operation>),
    Object { operations: Vec<Operation> },
}

impl Manifest {
    pub fn from_json(json: &str) -> serde_json::Result<Vec<Operation>> {
        Ok(serde_json::from_str::<Manifest>(json)?.into_operations())
    }

    pub fn into_operations(self) -> Vec<Operation> {
        match self {
            Manifest::List(operations) | Manifest::Object { operations } => operations,
        }
    }
}
