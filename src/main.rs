use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueHint};
use serde_json::{Map, Value, to_writer_pretty};
use service_pipeline::context::RunReport;
use service_pipeline::lockfile::generate_lock;
use service_pipeline::observability::{MetricsCollector, log_snapshot};
use service_pipeline::recipe::Recipe;
use service_pipeline::registry::StepRegistry;
use service_pipeline::steps;
use service_pipeline::validation::validate_recipe;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Run {
            recipe,
            input,
            input_json,
            strict,
            print_metrics,
            metrics_json,
            metrics_prometheus,
        } => {
            let input = load_input(input.as_deref(), input_json.as_deref())?;
            run_recipe(
                recipe,
                input,
                strict,
                MetricsOutputs {
                    print: print_metrics,
                    json: metrics_json,
                    prometheus: metrics_prometheus,
                },
            )
        }
        Commands::ListSteps => {
            list_steps();
            Ok(())
        }
        Commands::Validate { recipe } => validate_recipe_cmd(recipe),
        Commands::Lock { recipe, output } => lock_recipe(recipe, output),
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the run report
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

struct MetricsOutputs {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
}

fn load_input(path: Option<&Path>, inline: Option<&str>) -> Result<Map<String, Value>> {
    let value: Value = match (path, inline) {
        (Some(path), _) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read input file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse input JSON: {}", path.display()))?
        }
        (None, Some(inline)) => {
            serde_json::from_str(inline).context("Failed to parse --input-json")?
        }
        (None, None) => return Ok(Map::new()),
    };

    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("Pipeline input must be a JSON object, got {other}")),
    }
}

fn run_recipe(
    recipe_path: PathBuf,
    input: Map<String, Value>,
    strict: bool,
    outputs: MetricsOutputs,
) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = build_registry();
    let metrics = MetricsCollector::new();
    let pipeline = recipe
        .builder(&registry)
        .and_then(|builder| Ok(builder.metrics(metrics.clone()).build()?))
        .with_context(|| format!("Failed to build pipeline from {}", recipe_path.display()))?;

    let outcome = if strict {
        pipeline.run_strict(input)
    } else {
        pipeline.run(input)
    };

    let report = match &outcome {
        Ok(result) => result.report(),
        Err(err) => RunReport::from_context(err.context()),
    };
    print_report(&report)?;
    write_metrics(&metrics, outputs)?;

    match outcome {
        Ok(result) => {
            info!(
                pipeline = pipeline.name(),
                success = result.is_success(),
                "Pipeline completed"
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn print_report(report: &RunReport) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    serde_json::to_writer_pretty(&mut handle, report).context("Failed to write run report")?;
    writeln!(handle)?;
    Ok(())
}

fn write_metrics(metrics: &MetricsCollector, outputs: MetricsOutputs) -> Result<()> {
    if !outputs.print && outputs.json.is_none() && outputs.prometheus.is_none() {
        return Ok(());
    }

    let snapshot = metrics.snapshot();
    if outputs.print {
        log_snapshot(&snapshot);
    }
    if let Some(path) = outputs.json {
        ensure_parent(&path)?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = outputs.prometheus {
        ensure_parent(&path)?;
        std::fs::write(&path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn list_steps() {
    let registry = build_registry();
    println!("Available actions:");
    for name in registry.known_actions() {
        println!("- {name}");
    }
}

fn validate_recipe_cmd(recipe_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = build_registry();
    let report = validate_recipe(&recipe, &registry);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %recipe_path.display(), "Recipe validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lock_recipe(recipe_path: PathBuf, output_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = build_registry();
    let report = validate_recipe(&recipe, &registry);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        return Err(anyhow!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        ));
    }

    ensure_parent(&output_path)?;
    generate_lock(&recipe, &output_path)?;
    info!(lockfile = %output_path.display(), "Lockfile generated");
    Ok(())
}

fn build_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    steps::register_defaults(&mut registry);
    registry
}

#[derive(Parser)]
#[command(
    name = "service-pipeline",
    version,
    about = "Run, validate and lock declarative service pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a recipe once and print the JSON run report
    Run {
        #[arg(value_hint = ValueHint::FilePath)]
        recipe: PathBuf,
        /// JSON object file used as pipeline input
        #[arg(long, value_hint = ValueHint::FilePath, conflicts_with = "input_json")]
        input: Option<PathBuf>,
        /// Inline JSON object used as pipeline input
        #[arg(long = "input-json")]
        input_json: Option<String>,
        /// Exit non-zero on expected failures too
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
    },
    /// List registered policy, model and step actions
    ListSteps,
    /// Validate a recipe without running it
    Validate {
        #[arg(value_hint = ValueHint::FilePath)]
        recipe: PathBuf,
    },
    /// Write a lockfile pinning the recipe's steps and parameters
    Lock {
        #[arg(value_hint = ValueHint::FilePath)]
        recipe: PathBuf,
        #[arg(value_hint = ValueHint::FilePath)]
        output: PathBuf,
    },
}
