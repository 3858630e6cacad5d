//! The core, UI-agnostic library for the `imgops` disk image utility.
//!
//! `imgops-core` applies a declarative list of operations (copy a file, find
//! and replace bytes, run a script, burn the image to a drive) to a disk
//! image. Which operations apply is decided by runtime options such as the
//! target hardware variant, and everything that happens is reported through
//! an event stream so any front-end can display it.
//!
//! The library is structured into several key modules:
//! - [`operation`]: The declarative operation records and their JSON form.
//! - [`options`]: The runtime options operations are matched against.
//! - [`condition`]: Filtering operations by their `when` clauses.
//! - [`command`]: Binding each operation to the handler that executes it.
//! - [`pipeline`]: The sequential executor tying everything together.
//! - [`event`]: The events a run publishes and how its completion is observed.
//! - [`image`] and [`mod@write`]: The file and drive primitives the commands
//!   delegate to.
//!
//! ## Example: Running a Manifest
//!
//! ```rust,no_run
//! use imgops_core::{Event, Manifest, Options, Pipeline};
//! use anyhow::Result;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let operations = Manifest::from_json(&std::fs::read_to_string("device.json")?)?;
//!
//!     let mut options = Options::new();
//!     options.insert("drive".into(), "/dev/sdb".into());
//!
//!     let mut events = Pipeline::new("os.img", operations)
//!         .options(options)
//!         .execute()?;
//!
//!     // Invoked once the run has finished successfully, even if it already has.
//!     events.on_end(|| println!("Done!"));
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             Event::State(state) => println!("[{:5.1}%] {}", state.percentage, state.operation),
//!             Event::Stdout(chunk) => print!("{}", String::from_utf8_lossy(&chunk)),
//!             Event::Stderr(chunk) => eprint!("{}", String::from_utf8_lossy(&chunk)),
//!             Event::Burn(progress) => println!("{} bytes written", progress.transferred),
//!             Event::Error(e) => return Err(e.into()),
//!             Event::End => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod condition;
pub mod error;
pub mod event;
pub mod image;
pub mod operation;
pub mod options;
pub mod pipeline;
pub mod task;
pub mod write;

pub use error::{ErrorKind, PipelineError};
pub use event::{Completion, Event, EventStream, Outcome, State};
pub use operation::{Action, FileRef, Manifest, Operation, Partition};
pub use options::{OptionValue, Options};
pub use pipeline::{Pipeline, Plan, execute};
pub use write::{BurnProgress, BurnStage};
