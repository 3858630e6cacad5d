use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use imgops_core::options::{DRIVE_OPTION, parse_assignment, parse_text_assignment};
use imgops_core::pipeline::describe;
use imgops_core::{
    Action, BurnProgress, BurnStage, Event, Manifest, OptionValue, Options, Pipeline,
    PipelineError, Plan,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::{Write, stderr, stdout};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgops")]
#[command(about = "Apply declarative operation manifests to disk images", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a manifest's operations against an image
    Run {
        /// Image to operate on
        #[arg(required = true)]
        image: PathBuf,

        /// JSON file listing the operations
        #[arg(short, long)]
        manifest: PathBuf,

        /// Runtime option, repeatable (e.g. -o network=wifi)
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE", value_parser = parse_option)]
        options: Vec<(String, OptionValue)>,

        /// Runtime option whose value is always a string (e.g. -s variant=007)
        #[arg(short = 's', long = "text-option", value_name = "KEY=VALUE", value_parser = parse_text_option)]
        text_options: Vec<(String, OptionValue)>,

        /// Target drive for burn operations
        #[arg(short, long)]
        drive: Option<PathBuf>,

        /// Skip the confirmation prompt before burning
        #[arg(short, long)]
        yes: bool,
    },
    /// Show which operations would run with the given options
    Check {
        /// Image the operations would run against
        #[arg(required = true)]
        image: PathBuf,

        /// JSON file listing the operations
        #[arg(short, long)]
        manifest: PathBuf,

        /// Runtime option, repeatable (e.g. -o network=wifi)
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE", value_parser = parse_option)]
        options: Vec<(String, OptionValue)>,

        /// Runtime option whose value is always a string (e.g. -s variant=007)
        #[arg(short = 's', long = "text-option", value_name = "KEY=VALUE", value_parser = parse_text_option)]
        text_options: Vec<(String, OptionValue)>,

        /// Target drive for burn operations
        #[arg(short, long)]
        drive: Option<PathBuf>,
    },
}

fn parse_option(input: &str) -> Result<(String, OptionValue), String> {
    parse_assignment(input).map_err(|e| e.to_string())
}

fn parse_text_option(input: &str) -> Result<(String, OptionValue), String> {
    parse_text_assignment(input).map_err(|e| e.to_string())
}

fn build_options(
    pairs: Vec<(String, OptionValue)>,
    text_pairs: Vec<(String, OptionValue)>,
    drive: Option<PathBuf>,
) -> Options {
    let mut options: Options = pairs.into_iter().chain(text_pairs).collect();
    if let Some(drive) = drive {
        options.insert(
            DRIVE_OPTION.to_string(),
            OptionValue::String(drive.to_string_lossy().into_owned()),
        );
    }
    options
}

fn load_pipeline(image: &Path, manifest: &Path, options: Options) -> Result<Pipeline> {
    let text = std::fs::read_to_string(manifest)
        .with_context(|| format!("Failed to read manifest {}", manifest.display()))?;
    let operations = Manifest::from_json(&text)
        .with_context(|| format!("Invalid manifest {}", manifest.display()))?;
    Ok(Pipeline::new(image, operations).options(options))
}

/// Validates a pipeline, explaining missing options in a friendlier way.
fn plan(pipeline: &Pipeline) -> Result<Plan> {
    match pipeline.plan() {
        Ok(plan) => Ok(plan),
        Err(PipelineError::MissingOptions(names)) => {
            eprintln!("{} The manifest needs these options:", style("ERROR:").red().bold());
            for name in &names {
                eprintln!("  -o {}=...", style(name).cyan());
            }
            Err(PipelineError::MissingOptions(names).into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Returns `true` if the plan edits files of the pipeline image and also burns
/// it. The bundled file backend needs the image to be a directory tree while
/// burning needs a single file, so such a plan cannot succeed as written.
fn edits_and_burns_image(plan: &Plan) -> bool {
    let burns = plan
        .operations
        .iter()
        .any(|op| matches!(op.action, Action::Burn { .. }));
    let edits_image = plan.operations.iter().any(|op| match &op.action {
        Action::Copy { from, to } => from.image.is_none() || to.image.is_none(),
        Action::Replace { file, .. } => file.image.is_none(),
        _ => false,
    });
    burns && edits_image
}

fn warn_if_edits_and_burns(plan: &Plan) {
    if edits_and_burns_image(plan) {
        eprintln!(
            "{} This plan edits files in the image and also burns it. Files are edited in an \
             extracted directory tree, but a burn needs a single image file.",
            style("WARNING:").yellow().bold()
        );
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(&format!(
            "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
        ))?
        .progress_chars("■ "))
}

/// The progress bars shown while a run is in flight.
struct RunDisplay {
    multi: MultiProgress,
    steps: ProgressBar,
    burn: Option<(BurnStage, ProgressBar)>,
}

impl RunDisplay {
    fn new() -> Result<Self> {
        let multi = MultiProgress::new();
        let steps = multi.add(ProgressBar::new(1000));
        steps.set_prefix("Operations");
        steps.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:12} [{elapsed_precise}] [{bar:40.cyan/black}] {msg}")?
                .progress_chars("■ "),
        );
        Ok(Self {
            multi,
            steps,
            burn: None,
        })
    }

    fn state(&mut self, operation: &str, percentage: f64) {
        self.finish_burn("");
        self.steps.set_position((percentage * 10.0).round() as u64);
        self.steps.set_message(operation.to_string());
        self.multi
            .println(format!("{} {}", style("==>").blue().bold(), operation))
            .ok();
    }

    fn output(&self, chunk: &[u8], to_stderr: bool) {
        self.multi.suspend(|| {
            if to_stderr {
                stderr().write_all(chunk).ok();
            } else {
                stdout().write_all(chunk).ok();
            }
        });
    }

    fn burn(&mut self, progress: &BurnProgress) -> Result<()> {
        if self.burn.as_ref().map(|(stage, _)| *stage) != Some(progress.stage) {
            self.finish_burn("done.");
            let pb = self.multi.add(match progress.length {
                Some(len) => ProgressBar::new(len),
                None => ProgressBar::new_spinner(),
            });
            match progress.stage {
                BurnStage::Decompress => {
                    pb.set_prefix("Decompress");
                    pb.set_style(ProgressStyle::default_spinner().template(
                        "{prefix:12} [{elapsed_precise}] [{spinner}] {bytes} ({bytes_per_sec}) {msg}",
                    )?);
                    pb.enable_steady_tick(Duration::from_millis(100));
                }
                BurnStage::Write => {
                    pb.set_prefix("Writing");
                    pb.set_style(bar_style("green")?);
                }
                BurnStage::Verify => {
                    pb.set_prefix("Verifying");
                    pb.set_style(bar_style("magenta")?);
                }
            }
            self.burn = Some((progress.stage, pb));
        }

        if let Some((_, pb)) = &self.burn {
            pb.set_position(progress.transferred);
        }
        Ok(())
    }

    fn finish_burn(&mut self, message: &'static str) {
        if let Some((_, pb)) = self.burn.take() {
            pb.finish_with_message(message);
        }
    }

    fn finish(mut self, succeeded: bool) {
        if succeeded {
            self.finish_burn("done.");
            self.steps.finish_with_message("All operations complete.");
        } else {
            self.finish_burn("❌ Operation failed.");
            self.steps.abandon_with_message("❌ Operation failed.");
        }
    }
}

async fn run(pipeline: Pipeline, image: &Path, yes: bool, cancel: CancellationToken) -> Result<()> {
    let plan = plan(&pipeline)?;

    println!("{}", describe(image, &plan));
    println!();
    warn_if_edits_and_burns(&plan);

    let burns = plan
        .operations
        .iter()
        .any(|op| matches!(op.action, Action::Burn { .. }));
    if burns && !yes {
        let drive = plan
            .options
            .get(DRIVE_OPTION)
            .map(|d| d.to_string())
            .ok_or_else(|| anyhow!("The manifest burns the image but no --drive was given."))?;

        println!(
            "{} This will erase all data on '{}'.",
            style("WARNING:").red().bold(),
            drive,
        );
        println!("  Drive: {}", style(&drive).cyan());
        println!("  Image: {}", style(image.display()).cyan());
        println!();

        if !confirm_operation("Are you sure you want to proceed?")? {
            println!("Operation cancelled.");
            return Ok(());
        }
        println!();
    }

    let count = plan.operations.len();
    let mut events = pipeline.cancel_token(cancel).execute()?;
    let mut display = RunDisplay::new()?;

    while let Some(event) = events.recv().await {
        match event {
            Event::State(state) => display.state(&state.operation.to_string(), state.percentage),
            Event::Stdout(chunk) => display.output(&chunk, false),
            Event::Stderr(chunk) => display.output(&chunk, true),
            Event::Burn(progress) => display.burn(&progress)?,
            Event::Error(e) => {
                display.finish(false);
                return Err(e.into());
            }
            Event::End => {
                display.finish(true);
                println!(
                    "\n✨ Successfully applied {} operation(s) to {}.",
                    count,
                    style(image.display()).cyan()
                );
                return Ok(());
            }
        }
    }

    Err(anyhow!("Pipeline stopped without reporting an outcome."))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(stderr)
        .init();

    // Ctrl+C stops the run: no further step starts and a running script or
    // burn is interrupted.
    let cancel = CancellationToken::new();
    let c = cancel.clone();
    ctrlc::set_handler(move || {
        c.cancel();
    })?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            image,
            manifest,
            options,
            text_options,
            drive,
            yes,
        } => {
            let options = build_options(options, text_options, drive);
            let pipeline = load_pipeline(&image, &manifest, options)?;
            run(pipeline, &image, yes, cancel).await?;
        }
        Commands::Check {
            image,
            manifest,
            options,
            text_options,
            drive,
        } => {
            let options = build_options(options, text_options, drive);
            let pipeline = load_pipeline(&image, &manifest, options)?;
            let plan = plan(&pipeline)?;
            println!("{}", describe(&image, &plan));
            warn_if_edits_and_burns(&plan);
            if plan.operations.is_empty() {
                println!("  (no operations apply to these options)");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_flag_becomes_an_option() {
        let options = build_options(
            vec![("network".into(), OptionValue::from("wifi"))],
            vec![],
            Some(PathBuf::from("/dev/sdb")),
        );
        assert_eq!(options["network"], OptionValue::from("wifi"));
        assert_eq!(options[DRIVE_OPTION], OptionValue::from("/dev/sdb"));
    }

    #[test]
    fn cli_parses_repeated_options() {
        let cli = Cli::try_parse_from([
            "imgops", "run", "os.img", "-m", "ops.json", "-o", "slot=2", "-o", "variant=a",
        ])
        .unwrap();
        let Commands::Run { options, .. } = cli.command else {
            panic!("expected the run command");
        };
        assert_eq!(
            options,
            vec![
                ("slot".to_string(), OptionValue::Number(2.0)),
                ("variant".to_string(), OptionValue::from("a")),
            ]
        );
    }

    #[test]
    fn malformed_options_are_rejected() {
        assert!(Cli::try_parse_from(["imgops", "check", "os.img", "-m", "ops.json", "-o", "x"]).is_err());
    }

    #[test]
    fn text_options_keep_leading_zeros() {
        let cli = Cli::try_parse_from([
            "imgops", "check", "os.img", "-m", "ops.json", "-s", "variant=007", "-o", "slot=007",
        ])
        .unwrap();
        let Commands::Check {
            options,
            text_options,
            drive,
            ..
        } = cli.command
        else {
            panic!("expected the check command");
        };
        let options = build_options(options, text_options, drive);
        assert_eq!(options["variant"], OptionValue::from("007"));
        assert_eq!(options["slot"], OptionValue::Number(7.0));
    }

    #[test]
    fn flags_plans_that_edit_and_burn_the_same_image() {
        use imgops_core::{FileRef, Operation};

        let replace = |image: Option<PathBuf>| {
            Operation::new(Action::Replace {
                file: FileRef {
                    image,
                    ..FileRef::new(None, "/config.txt")
                },
                find: "a".into(),
                replace: "b".into(),
            })
        };
        let burn = Operation::new(Action::Burn { verify: true });
        let plan = |operations| Plan {
            options: Options::new(),
            operations,
        };

        assert!(edits_and_burns_image(&plan(vec![replace(None), burn.clone()])));
        assert!(!edits_and_burns_image(&plan(vec![
            replace(Some("/mnt/rootfs".into())),
            burn.clone(),
        ])));
        assert!(!edits_and_burns_image(&plan(vec![replace(None)])));
    }
}
