use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use shotlab_core::{AnalysisStats, StatsError, Targets, Task, WorkDeficit};
use shotlab_dem::DecoderRegistry;
use std::fs;
use std::path::{Path, PathBuf};

/// How sub-batch sizes are chosen for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub start_batch_size: u64,
    pub max_batch_size: u64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            start_batch_size: 100,
            max_batch_size: 100_000,
        }
    }
}

impl BatchPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.start_batch_size == 0 {
            return Err(StatsError::Config("start batch size must be at least 1".to_string()).into());
        }
        if self.max_batch_size < self.start_batch_size {
            return Err(StatsError::Config(format!(
                "max batch size ({}) is smaller than start batch size ({})",
                self.max_batch_size, self.start_batch_size
            ))
            .into());
        }
        Ok(())
    }

    /// Size of the next sub-batch, or 0 when the unclaimed deficit is empty.
    ///
    /// Starts at `start_batch_size` and doubles with the shots already
    /// collected, capped by `max_batch_size`, by the shot deficit not yet
    /// claimed by in-flight batches, and, once errors have been seen, by the
    /// shots expected to reach the error target.
    pub fn next_batch(&self, collected: &AnalysisStats, deficit: &WorkDeficit, in_flight: u64) -> u64 {
        let unclaimed = deficit.remaining_shots.saturating_sub(in_flight);
        if unclaimed == 0 {
            return 0;
        }
        let mut size = self
            .start_batch_size
            .max(collected.shots)
            .min(self.max_batch_size);
        if let Some(remaining_errors) = deficit.remaining_errors {
            if collected.errors > 0 {
                let shots_per_error = collected.shots as f64 / collected.errors as f64;
                let expected = (remaining_errors as f64 * shots_per_error).ceil() as u64;
                size = size.min(expected.max(1));
            }
        }
        size.min(unclaimed).max(1)
    }
}

/// When the save-resume table is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointPolicy {
    #[default]
    EveryIncrement,
    AtEnd,
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub processes: usize,
    pub batch: BatchPolicy,
    /// Wall-clock limit after which no new sub-batch is dispatched.
    pub max_seconds: Option<f64>,
    /// Shot ceiling for this invocation, across all tasks.
    pub max_total_shots: Option<u64>,
    /// Worker `i` is seeded with `seed + i`; OS entropy when unset.
    pub seed: Option<u64>,
    /// Tables that count toward targets but are not rewritten.
    pub existing_data: Vec<PathBuf>,
    /// Table that is resumed from and checkpointed into.
    pub save_resume: Option<PathBuf>,
    pub checkpoint: CheckpointPolicy,
    pub decoders: DecoderRegistry,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            processes: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            batch: BatchPolicy::default(),
            max_seconds: None,
            max_total_shots: None,
            seed: None,
            existing_data: Vec::new(),
            save_resume: None,
            checkpoint: CheckpointPolicy::default(),
            decoders: DecoderRegistry::default(),
        }
    }
}

impl CollectOptions {
    pub fn validate(&self) -> Result<()> {
        if self.processes == 0 {
            return Err(StatsError::Config("processes must be at least 1".to_string()).into());
        }
        if let Some(s) = self.max_seconds {
            if !s.is_finite() || s < 0.0 {
                return Err(StatsError::Config(format!("max seconds must be >= 0, got {}", s)).into());
            }
        }
        self.batch.validate()
    }
}

/// How `json_metadata` is derived for circuits given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataMode {
    /// `{"path": <path as given>}`
    #[default]
    Path,
    /// Parsed from `k=v` pairs in the file name.
    CommaSeparatedKeyValues,
}

/// A circuit file paired with the decoders to run on it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub circuit_path: PathBuf,
    pub decoders: Vec<String>,
    pub json_metadata: Value,
    pub postselected_detectors: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(default)]
    max_shots: Option<u64>,
    #[serde(default)]
    max_errors: Option<u64>,
    tasks: Vec<PlanTask>,
}

#[derive(Debug, Deserialize)]
struct PlanTask {
    circuit: PathBuf,
    decoders: Vec<String>,
    #[serde(default)]
    json_metadata: Option<Value>,
    #[serde(default)]
    postselected_detectors: Vec<u32>,
}

/// Tasks and default targets read from a YAML plan file.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub max_shots: Option<u64>,
    pub max_errors: Option<u64>,
    pub specs: Vec<TaskSpec>,
}

pub fn load_plan(path: &Path) -> Result<Plan> {
    let raw = fs::read_to_string(path)
        .map_err(|e| StatsError::Config(format!("cannot read plan {}: {}", path.display(), e)))?;
    let plan: PlanFile = serde_yaml::from_str(&raw)
        .map_err(|e| StatsError::Config(format!("invalid plan {}: {}", path.display(), e)))?;
    let base = path.parent().unwrap_or(Path::new("."));
    let mut specs = Vec::with_capacity(plan.tasks.len());
    for task in plan.tasks {
        let circuit_path = if task.circuit.is_absolute() {
            task.circuit
        } else {
            base.join(&task.circuit)
        };
        let json_metadata = match task.json_metadata {
            Some(v) => v,
            None => path_metadata(&circuit_path),
        };
        specs.push(TaskSpec {
            circuit_path,
            decoders: task.decoders,
            json_metadata,
            postselected_detectors: task.postselected_detectors,
        });
    }
    Ok(Plan {
        max_shots: plan.max_shots,
        max_errors: plan.max_errors,
        specs,
    })
}

pub fn specs_from_circuits(
    circuits: &[PathBuf],
    decoders: &[String],
    mode: MetadataMode,
) -> Result<Vec<TaskSpec>> {
    circuits
        .iter()
        .map(|path| {
            let json_metadata = match mode {
                MetadataMode::Path => path_metadata(path),
                MetadataMode::CommaSeparatedKeyValues => comma_separated_key_values(path)?,
            };
            Ok(TaskSpec {
                circuit_path: path.clone(),
                decoders: decoders.to_vec(),
                json_metadata,
                postselected_detectors: Vec::new(),
            })
        })
        .collect()
}

fn path_metadata(path: &Path) -> Value {
    let mut map = Map::new();
    map.insert(
        "path".to_string(),
        Value::String(path.to_string_lossy().to_string()),
    );
    Value::Object(map)
}

/// `d=3,p=0.02,c=rep.dem` becomes `{"c":"rep","d":3,"p":0.02}`. Values parse
/// as integers, then floats, else stay strings.
pub fn comma_separated_key_values(path: &Path) -> Result<Value> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| StatsError::Config(format!("no file name in {}", path.display())))?;
    let stem = match name.rfind('.') {
        Some(i) => &name[..i],
        None => name,
    };
    let mut map = Map::new();
    for term in stem.split(',') {
        let (key, raw) = term.split_once('=').ok_or_else(|| {
            StatsError::Config(format!(
                "expected key=value terms in file name '{}', found '{}'",
                name, term
            ))
        })?;
        let value = if let Ok(i) = raw.parse::<i64>() {
            Value::Number(i.into())
        } else if let Some(f) = raw.parse::<f64>().ok().and_then(Number::from_f64) {
            Value::Number(f)
        } else {
            Value::String(raw.to_string())
        };
        map.insert(key.to_string(), value);
    }
    Ok(Value::Object(map))
}

/// Reads every circuit and expands specs into one task per decoder. Fails
/// before any sampling if a circuit cannot be read or a decoder is unknown.
pub fn build_tasks(specs: &[TaskSpec], targets: Targets, registry: &DecoderRegistry) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();
    for spec in specs {
        if spec.decoders.is_empty() {
            return Err(StatsError::Config(format!(
                "no decoders given for {}",
                spec.circuit_path.display()
            ))
            .into());
        }
        let circuit = fs::read_to_string(&spec.circuit_path).map_err(|e| {
            StatsError::Config(format!(
                "cannot read circuit {}: {}",
                spec.circuit_path.display(),
                e
            ))
        })?;
        for decoder in &spec.decoders {
            registry
                .get(decoder)
                .map_err(|e| StatsError::Config(e.to_string()))?;
            tasks.push(Task::with_postselection(
                circuit.clone(),
                decoder.clone(),
                spec.json_metadata.clone(),
                spec.postselected_detectors.clone(),
                targets,
            ));
        }
    }
    if tasks.is_empty() {
        return Err(anyhow!(StatsError::Config("no tasks to collect".to_string())));
    }
    Ok(tasks)
}
