//! tomoflow - command line entry point
//!
//! `run` builds and executes a pipeline file. `run-chain` is the command
//! the external executor starts inside its container.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tomoflow::{
    config::{self, ExecutionMode, LoggingSettings, PipelineFile, PipelineSettings},
    executor::marshal,
    pipeline::{Pipeline, PipelineTree},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "tomoflow",
    version,
    about = "Execution coordinator for operator chains over image volumes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (default: platform config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    InProcess,
    External,
}

impl From<Mode> for ExecutionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::InProcess => ExecutionMode::InProcess,
            Mode::External => ExecutionMode::External,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build and execute a pipeline file
    Run {
        /// Path to the pipeline TOML file
        pipeline: PathBuf,
        /// Where to write the final volume
        #[arg(short, long, default_value = "output.vol")]
        output: PathBuf,
        /// Override the configured execution mode
        #[arg(long, value_enum)]
        mode: Option<Mode>,
        /// Seconds to wait for each chain
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },
    /// Run a marshalled chain (used inside the external container)
    RunChain {
        #[arg(long)]
        state: PathBuf,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Print the effective settings, optionally writing the defaults
    Settings {
        /// Write default settings if no settings file exists
        #[arg(long)]
        init: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => PipelineSettings::load_from(path)
            .with_context(|| format!("Failed to load settings from {:?}", path))?,
        None => PipelineSettings::load_or_default(),
    };
    let _guard = init_logging(&settings.logging);

    match cli.command {
        Commands::Run {
            pipeline,
            output,
            mode,
            timeout,
        } => {
            let settings = match mode {
                Some(mode) => settings.with_mode(mode.into()),
                None => settings,
            };
            run(&pipeline, &output, settings, Duration::from_secs(timeout))
        }
        Commands::RunChain {
            state,
            input,
            output,
        } => {
            marshal::run_chain_files(&state, &input, &output)?;
            Ok(())
        }
        Commands::Settings { init } => {
            if init && config::settings_path().is_some_and(|p| !p.exists()) {
                settings.save()?;
            }
            if let Some(path) = config::settings_path() {
                println!("# {}", path.display());
            }
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

/// Console logging, plus a daily rolling file when a log directory is set.
///
/// `RUST_LOG` takes precedence over the configured filter. The returned
/// guard flushes the file writer on drop.
fn init_logging(
    logging: &LoggingSettings,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    match &logging.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tomoflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn run(
    path: &Path,
    output: &Path,
    settings: PipelineSettings,
    timeout: Duration,
) -> anyhow::Result<()> {
    let file = PipelineFile::load(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    tracing::info!("Running {:?} ({})", path, settings.execution_mode);

    let pipeline = Pipeline::from_file(&file, base, settings, timeout)?;
    print_tree(pipeline.tree());

    let result = pipeline.transformed_data_source(None);
    let volume = pipeline
        .tree()
        .ds(result)?
        .volume()
        .context("pipeline produced no volume")?;
    volume.save(output)?;
    match volume.range() {
        Some((min, max)) => println!("Wrote {:?} (range {} .. {})", output, min, max),
        None => println!("Wrote {:?} (empty)", output),
    }
    Ok(())
}

fn print_tree(tree: &PipelineTree) {
    fn walk(tree: &PipelineTree, ds: tomoflow::DataSourceId, depth: usize) {
        let Some(data_source) = tree.data_source(ds) else {
            return;
        };
        let shape = data_source
            .volume()
            .map(|v| format!("{:?}", v.shape()))
            .unwrap_or_else(|| "-".to_string());
        println!("{:indent$}{} {}", "", data_source.label(), shape, indent = depth * 2);
        for &op in data_source.operators() {
            let Some(operator) = tree.operator(op) else {
                continue;
            };
            println!(
                "{:indent$}- {} [{}]",
                "",
                operator.name(),
                operator.state().label(),
                indent = depth * 2 + 2
            );
            if let Some(child) = operator.child() {
                walk(tree, child, depth + 2);
            }
        }
    }
    walk(tree, tree.root(), 0);
}
