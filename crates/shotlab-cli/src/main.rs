use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use shotlab_core::{atomic_write_bytes, StatsError, Targets};
use shotlab_dem::{
    predict_observables, read_detection_events, write_predictions, DecoderRegistry,
    DetectorErrorModel, ShotFormat,
};
use shotlab_runner::{
    build_tasks, collect, load_plan, specs_from_circuits, BatchPolicy, CheckpointPolicy,
    CollectOptions, CollectReport, MetadataMode,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "shotlab",
    version = "0.3.0",
    about = "Monte Carlo collection of decoder error statistics"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MetadataArg {
    #[value(name = "path")]
    Path,
    #[value(name = "comma-separated-key-values")]
    CommaSeparatedKeyValues,
}

impl From<MetadataArg> for MetadataMode {
    fn from(value: MetadataArg) -> Self {
        match value {
            MetadataArg::Path => MetadataMode::Path,
            MetadataArg::CommaSeparatedKeyValues => MetadataMode::CommaSeparatedKeyValues,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CheckpointArg {
    #[value(name = "every_increment")]
    EveryIncrement,
    #[value(name = "at_end")]
    AtEnd,
}

impl From<CheckpointArg> for CheckpointPolicy {
    fn from(value: CheckpointArg) -> Self {
        match value {
            CheckpointArg::EveryIncrement => CheckpointPolicy::EveryIncrement,
            CheckpointArg::AtEnd => CheckpointPolicy::AtEnd,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    #[value(name = "01")]
    ZeroOne,
    #[value(name = "dets")]
    Dets,
    #[value(name = "hits")]
    Hits,
}

impl From<FormatArg> for ShotFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::ZeroOne => ShotFormat::ZeroOne,
            FormatArg::Dets => ShotFormat::Dets,
            FormatArg::Hits => ShotFormat::Hits,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sample circuits until each task reaches its shot or error target.
    Collect {
        #[arg(long, num_args = 1..)]
        circuits: Vec<PathBuf>,
        #[arg(long, num_args = 1..)]
        decoders: Vec<String>,
        #[arg(long)]
        max_shots: Option<u64>,
        #[arg(long)]
        max_errors: Option<u64>,
        #[arg(long)]
        processes: Option<usize>,
        #[arg(long, num_args = 1..)]
        existing_data: Vec<PathBuf>,
        #[arg(long)]
        save_resume: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "path")]
        metadata: MetadataArg,
        #[arg(long)]
        start_batch_size: Option<u64>,
        #[arg(long)]
        max_batch_size: Option<u64>,
        #[arg(long)]
        max_seconds: Option<f64>,
        #[arg(long)]
        max_total_shots: Option<u64>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        plan: Option<PathBuf>,
        #[arg(long, value_enum)]
        checkpoint: Option<CheckpointArg>,
        #[arg(long)]
        quiet: bool,
        #[arg(long)]
        json: bool,
    },
    /// Merge stats tables and print the canonical result.
    Combine {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Decode recorded detection events and write predicted observable flips.
    Predict {
        #[arg(long)]
        dets: PathBuf,
        #[arg(long)]
        dem: PathBuf,
        #[arg(long)]
        decoder: String,
        #[arg(long, value_enum, default_value = "dets")]
        dets_format: FormatArg,
        #[arg(long)]
        obs_out: PathBuf,
        #[arg(long, value_enum, default_value = "01")]
        obs_out_format: FormatArg,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(command_quiet(&cli.command));
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload.get("ok") == Some(&Value::Bool(false)) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    // stdout carries tables only.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Collect {
            circuits,
            decoders,
            max_shots,
            max_errors,
            processes,
            existing_data,
            save_resume,
            metadata,
            start_batch_size,
            max_batch_size,
            max_seconds,
            max_total_shots,
            seed,
            plan,
            checkpoint,
            quiet: _,
            json,
        } => {
            let registry = DecoderRegistry::default();
            let mut specs = Vec::new();
            let mut plan_targets = (None, None);
            if let Some(plan_path) = &plan {
                let plan = load_plan(plan_path)?;
                plan_targets = (plan.max_shots, plan.max_errors);
                specs.extend(plan.specs);
            }
            if !circuits.is_empty() {
                specs.extend(specs_from_circuits(&circuits, &decoders, metadata.into())?);
            }
            let max_shots = max_shots.or(plan_targets.0).ok_or_else(|| {
                anyhow!(StatsError::Config(
                    "--max-shots is required unless the plan sets max_shots".to_string()
                ))
            })?;
            let targets = Targets::new(max_shots, max_errors.or(plan_targets.1))?;
            let tasks = build_tasks(&specs, targets, &registry)?;

            let defaults = CollectOptions::default();
            let options = CollectOptions {
                processes: processes.unwrap_or(defaults.processes),
                batch: BatchPolicy {
                    start_batch_size: start_batch_size
                        .unwrap_or(defaults.batch.start_batch_size),
                    max_batch_size: max_batch_size.unwrap_or(defaults.batch.max_batch_size),
                },
                max_seconds,
                max_total_shots,
                seed,
                existing_data,
                save_resume,
                checkpoint: checkpoint.map(Into::into).unwrap_or(defaults.checkpoint),
                decoders: registry,
            };
            let report = collect(tasks, &options)?;
            if json {
                return Ok(Some(report_to_json(&report)));
            }
            if options.save_resume.is_none() {
                print!("{}", report.saved.to_table_string());
            }
            if !report.is_success() {
                for failure in &report.failures {
                    eprintln!("error: {}", failure);
                }
                return Err(anyhow!(
                    "{} sub-batches failed across {} tasks",
                    report.failures.len(),
                    report
                        .tasks
                        .iter()
                        .filter(|t| t.phase == shotlab_runner::TaskPhase::Failed)
                        .count()
                ));
            }
        }
        Commands::Combine { paths } => {
            print!("{}", shotlab_core::combine(&paths)?);
        }
        Commands::Predict {
            dets,
            dem,
            decoder,
            dets_format,
            obs_out,
            obs_out_format,
        } => {
            let shots = predict(
                &dets,
                &dem,
                &decoder,
                dets_format.into(),
                &obs_out,
                obs_out_format.into(),
            )?;
            info!(shots, out = %obs_out.display(), "wrote predictions");
        }
    }
    Ok(None)
}

fn predict(
    dets: &Path,
    dem: &Path,
    decoder: &str,
    dets_format: ShotFormat,
    obs_out: &Path,
    obs_out_format: ShotFormat,
) -> Result<usize> {
    let dem_text = fs::read_to_string(dem)
        .with_context(|| format!("failed to read error model {}", dem.display()))?;
    let model = DetectorErrorModel::parse(&dem_text)
        .with_context(|| format!("invalid error model {}", dem.display()))?;
    let dets_text = fs::read_to_string(dets)
        .with_context(|| format!("failed to read detection events {}", dets.display()))?;
    let shots = read_detection_events(&dets_text, dets_format, model.num_detectors)
        .with_context(|| format!("invalid detection events {}", dets.display()))?;
    let predictions = predict_observables(&DecoderRegistry::default(), decoder, &model, &shots)?;
    let out = write_predictions(&predictions, obs_out_format, model.num_observables);
    atomic_write_bytes(obs_out, out.as_bytes())?;
    Ok(predictions.len())
}

fn report_to_json(report: &CollectReport) -> Value {
    json!({
        "ok": report.is_success(),
        "command": "collect",
        "shots_sampled": report.shots_sampled,
        "halted": report.halted,
        "tasks": report.tasks,
        "failures": report
            .failures
            .iter()
            .map(|f| json!({
                "strong_id": f.strong_id,
                "decoder": f.decoder,
                "message": f.message
            }))
            .collect::<Vec<_>>()
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Collect { json, .. } => *json,
        _ => false,
    }
}

fn command_quiet(command: &Commands) -> bool {
    match command {
        Commands::Collect { quiet, .. } => *quiet,
        _ => false,
    }
}
