use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::Serialize;
use serde_json::Value;
use shotlab_core::{
    ensure_table_exists, AnalysisStats, Exhausted, ExistingData, StatsError, Task, TaskStats,
};
use tracing::{debug, info, warn};

use crate::config::{CheckpointPolicy, CollectOptions};
use crate::worker::{PreparedTask, Worker, WorkerError};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Pending,
    InProgress,
    /// Targets were already met by recorded data when the run started.
    Complete,
    ErrorBudgetExhausted,
    ShotBudgetExhausted,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskPhase::Pending | TaskPhase::InProgress)
    }
}

/// Why dispatch stopped before every task reached a terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    MaxSeconds,
    MaxTotalShots,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub strong_id: String,
    pub decoder: String,
    pub json_metadata: Value,
    pub phase: TaskPhase,
    /// Everything known for the task, including existing data.
    pub stats: AnalysisStats,
}

#[derive(Debug, Clone)]
pub struct CollectReport {
    pub tasks: Vec<TaskReport>,
    /// The save-resume table contents: resumed rows plus this run's work.
    pub saved: ExistingData,
    pub shots_sampled: u64,
    pub failures: Vec<WorkerError>,
    pub halted: Option<HaltReason>,
}

impl CollectReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Slot {
    prepared: Arc<PreparedTask>,
    collected: AnalysisStats,
    in_flight: u64,
    phase: TaskPhase,
}

impl Slot {
    fn exhausted_phase(&self) -> Option<TaskPhase> {
        let deficit = self.prepared.task.deficit(&self.collected);
        if !deficit.is_complete() {
            return None;
        }
        Some(match deficit.exhausted {
            Some(Exhausted::Errors) => TaskPhase::ErrorBudgetExhausted,
            _ => TaskPhase::ShotBudgetExhausted,
        })
    }
}

struct Job {
    slot: usize,
    prepared: Arc<PreparedTask>,
    shots: u64,
}

struct Outcome {
    slot: usize,
    shots: u64,
    result: std::result::Result<AnalysisStats, WorkerError>,
}

/// Samples every task until its targets are met, merging increments into
/// the save-resume table as they arrive.
///
/// Circuits and decoders are validated before any worker starts. A task
/// whose sub-batch fails is marked [`TaskPhase::Failed`] and the others
/// continue. Rerunning with the same table only samples the remaining
/// deficit.
pub fn collect(tasks: Vec<Task>, options: &CollectOptions) -> Result<CollectReport> {
    options.validate()?;

    let existing_data = distinct_existing_data(options)?;
    let baseline =
        ExistingData::from_files(&existing_data).context("failed to load existing data")?;
    let mut saved = match &options.save_resume {
        Some(path) if path.exists() => ExistingData::from_file(path)
            .with_context(|| format!("failed to load resume table {}", path.display()))?,
        _ => ExistingData::new(),
    };

    let mut slots = Vec::with_capacity(tasks.len());
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for task in tasks {
        if let Some(&first) = seen.get(task.strong_id()) {
            let first: &Slot = &slots[first];
            check_identity(&first.prepared.task, &task)?;
            debug!(strong_id = task.strong_id(), "skipping duplicate task");
            continue;
        }
        for store in [&baseline, &saved] {
            if let Some(row) = store.get(task.strong_id()) {
                check_recorded_identity(row, &task)?;
            }
        }
        let collected = baseline
            .stats_for(task.strong_id())
            .merge(&saved.stats_for(task.strong_id()))
            .ok_or_else(|| StatsError::CountOverflow {
                strong_id: task.strong_id().to_string(),
            })?;
        let phase = if task.deficit(&collected).is_complete() {
            TaskPhase::Complete
        } else {
            TaskPhase::Pending
        };
        let prepared = PreparedTask::new(task, &options.decoders)?;
        seen.insert(prepared.task.strong_id().to_string(), slots.len());
        slots.push(Slot {
            prepared: Arc::new(prepared),
            collected,
            in_flight: 0,
            phase,
        });
    }

    if let Some(path) = &options.save_resume {
        if ensure_table_exists(path)? {
            info!(path = %path.display(), "created save-resume table");
        }
    }

    let pending = slots.iter().filter(|s| !s.phase.is_terminal()).count();
    info!(
        tasks = slots.len(),
        pending,
        processes = options.processes,
        "starting collection"
    );

    let mut run = Run {
        options,
        slots,
        saved: &mut saved,
        shots_sampled: 0,
        shots_dispatched: 0,
        failures: Vec::new(),
        halted: None,
        dirty: false,
    };
    if pending > 0 {
        run.execute()?;
    }
    if options.checkpoint == CheckpointPolicy::AtEnd && run.dirty {
        run.checkpoint()?;
    }

    let Run {
        slots,
        shots_sampled,
        failures,
        halted,
        ..
    } = run;
    let tasks = slots
        .into_iter()
        .map(|slot| TaskReport {
            strong_id: slot.prepared.task.strong_id().to_string(),
            decoder: slot.prepared.task.decoder().to_string(),
            json_metadata: slot.prepared.task.json_metadata().clone(),
            phase: slot.phase,
            stats: slot.collected,
        })
        .collect();
    info!(shots = shots_sampled, failures = failures.len(), "collection finished");
    Ok(CollectReport {
        tasks,
        saved,
        shots_sampled,
        failures,
        halted,
    })
}

/// Existing-data paths with the save-resume table removed, so its rows are
/// counted once.
fn distinct_existing_data(options: &CollectOptions) -> Result<Vec<PathBuf>> {
    let resume = match &options.save_resume {
        Some(path) if path.exists() => Some(
            fs::canonicalize(path)
                .with_context(|| format!("failed to resolve {}", path.display()))?,
        ),
        _ => None,
    };
    let mut kept: Vec<PathBuf> = Vec::with_capacity(options.existing_data.len());
    for path in &options.existing_data {
        let resolved = fs::canonicalize(path).map_err(|source| StatsError::Io {
            path: path.clone(),
            source,
        })?;
        if resume.as_ref() == Some(&resolved) {
            warn!(
                path = %path.display(),
                "existing data is also the save-resume table; counting it once"
            );
            continue;
        }
        kept.push(path.clone());
    }
    Ok(kept)
}

/// Seed for worker `worker`. Mixing in the shots already recorded keeps a
/// resumed run from replaying the streams of the run it continues.
fn worker_seed(base: u64, worker: usize, recorded_shots: u64) -> u64 {
    base.wrapping_add(worker as u64)
        .wrapping_add(recorded_shots.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

fn check_identity(first: &Task, second: &Task) -> Result<()> {
    if first.decoder() != second.decoder() || first.json_metadata() != second.json_metadata() {
        return Err(StatsError::IdentityCollision {
            strong_id: first.strong_id().to_string(),
            first: describe(first.decoder(), first.json_metadata()),
            second: describe(second.decoder(), second.json_metadata()),
        }
        .into());
    }
    Ok(())
}

fn check_recorded_identity(row: &TaskStats, task: &Task) -> Result<()> {
    if row.decoder != task.decoder() || &row.json_metadata != task.json_metadata() {
        return Err(StatsError::IdentityCollision {
            strong_id: row.strong_id.clone(),
            first: describe(&row.decoder, &row.json_metadata),
            second: describe(task.decoder(), task.json_metadata()),
        }
        .into());
    }
    Ok(())
}

fn describe(decoder: &str, json_metadata: &Value) -> String {
    format!("decoder={} json_metadata={}", decoder, json_metadata)
}

struct Run<'a> {
    options: &'a CollectOptions,
    slots: Vec<Slot>,
    saved: &'a mut ExistingData,
    shots_sampled: u64,
    shots_dispatched: u64,
    failures: Vec<WorkerError>,
    halted: Option<HaltReason>,
    dirty: bool,
}

impl Run<'_> {
    fn execute(&mut self) -> Result<()> {
        let processes = self.options.processes;
        let (job_tx, job_rx) = bounded::<Job>(processes);
        let (outcome_tx, outcome_rx) = unbounded::<Outcome>();

        let recorded_shots = self
            .slots
            .iter()
            .fold(0u64, |acc, s| acc.wrapping_add(s.collected.shots));
        let mut handles = Vec::with_capacity(processes);
        for idx in 0..processes {
            let seed = match self.options.seed {
                Some(seed) => worker_seed(seed, idx, recorded_shots),
                None => rand::random::<u64>(),
            };
            let rx = job_rx.clone();
            let tx = outcome_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("shotlab-worker-{idx}"))
                .spawn(move || worker_loop(Worker::new(seed), rx, tx))
                .context("failed to spawn worker thread")?;
            handles.push(handle);
        }
        drop(job_rx);
        drop(outcome_tx);

        let result = self.schedule(&job_tx, &outcome_rx);

        // Closing the job channel lets workers exit once idle.
        drop(job_tx);
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked outside a sub-batch");
            }
        }
        result
    }

    fn schedule(&mut self, job_tx: &Sender<Job>, outcome_rx: &Receiver<Outcome>) -> Result<()> {
        let started = Instant::now();
        let deadline = self
            .options
            .max_seconds
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .and_then(|limit| started.checked_add(limit));
        let mut cursor = 0usize;
        let mut in_flight = 0usize;
        let mut last_progress = Instant::now();

        loop {
            if self.halted.is_none() {
                self.halted = self.check_ceilings(deadline);
                if let Some(reason) = self.halted {
                    warn!(?reason, in_flight, "ceiling reached, draining in-flight batches");
                }
            }
            while self.halted.is_none() && in_flight < self.options.processes {
                let Some(job) = self.next_job(&mut cursor) else {
                    break;
                };
                job_tx
                    .send(job)
                    .context("worker pool stopped accepting batches")?;
                in_flight += 1;
            }
            if in_flight == 0 {
                return Ok(());
            }

            let outcome = outcome_rx
                .recv()
                .context("all workers exited with batches outstanding")?;
            in_flight -= 1;
            self.absorb(outcome)?;

            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                last_progress = Instant::now();
                let done = self.slots.iter().filter(|s| s.phase.is_terminal()).count();
                info!(
                    done,
                    total = self.slots.len(),
                    shots = self.shots_sampled,
                    elapsed_s = started.elapsed().as_secs(),
                    "progress"
                );
            }
        }
    }

    fn check_ceilings(&self, deadline: Option<Instant>) -> Option<HaltReason> {
        if deadline.map_or(false, |d| Instant::now() >= d) {
            return Some(HaltReason::MaxSeconds);
        }
        if self
            .options
            .max_total_shots
            .map_or(false, |cap| self.shots_dispatched >= cap)
        {
            return Some(HaltReason::MaxTotalShots);
        }
        None
    }

    /// Picks the next non-terminal task with unclaimed deficit, round-robin.
    fn next_job(&mut self, cursor: &mut usize) -> Option<Job> {
        let n = self.slots.len();
        let budget = self
            .options
            .max_total_shots
            .map(|cap| cap.saturating_sub(self.shots_dispatched));
        if budget == Some(0) {
            return None;
        }
        for step in 0..n {
            let idx = (*cursor + step) % n;
            let slot = &mut self.slots[idx];
            if slot.phase.is_terminal() {
                continue;
            }
            let deficit = slot.prepared.task.deficit(&slot.collected);
            let mut shots = self
                .options
                .batch
                .next_batch(&slot.collected, &deficit, slot.in_flight);
            if let Some(budget) = budget {
                shots = shots.min(budget);
            }
            if shots == 0 {
                continue;
            }
            slot.in_flight += shots;
            slot.phase = TaskPhase::InProgress;
            self.shots_dispatched += shots;
            *cursor = (idx + 1) % n;
            debug!(strong_id = slot.prepared.task.strong_id(), shots, "dispatching batch");
            return Some(Job {
                slot: idx,
                prepared: Arc::clone(&slot.prepared),
                shots,
            });
        }
        None
    }

    fn absorb(&mut self, outcome: Outcome) -> Result<()> {
        let slot = &mut self.slots[outcome.slot];
        slot.in_flight = slot.in_flight.saturating_sub(outcome.shots);
        match outcome.result {
            Ok(increment) => {
                self.saved.add_increment(&slot.prepared.task, increment)?;
                slot.collected = slot.collected.merge(&increment).ok_or_else(|| {
                    StatsError::CountOverflow {
                        strong_id: slot.prepared.task.strong_id().to_string(),
                    }
                })?;
                self.shots_sampled += increment.shots;
                self.dirty = true;
                debug!(
                    strong_id = slot.prepared.task.strong_id(),
                    shots = increment.shots,
                    errors = increment.errors,
                    "merged batch"
                );
                if slot.phase == TaskPhase::InProgress {
                    if let Some(phase) = slot.exhausted_phase() {
                        slot.phase = phase;
                        info!(
                            strong_id = slot.prepared.task.strong_id(),
                            decoder = slot.prepared.task.decoder(),
                            shots = slot.collected.shots,
                            errors = slot.collected.errors,
                            phase = ?phase,
                            "task finished"
                        );
                    }
                }
                if self.options.checkpoint == CheckpointPolicy::EveryIncrement {
                    self.checkpoint()?;
                }
            }
            Err(err) => {
                warn!(error = %err, "sub-batch failed");
                slot.phase = TaskPhase::Failed;
                self.failures.push(err);
            }
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        if let Some(path) = &self.options.save_resume {
            self.saved.save(path)?;
            self.dirty = false;
        }
        Ok(())
    }
}

fn worker_loop(mut worker: Worker, jobs: Receiver<Job>, outcomes: Sender<Outcome>) {
    for job in jobs.iter() {
        let result = worker.run(&job.prepared, job.shots);
        let outcome = Outcome {
            slot: job.slot,
            shots: job.shots,
            result,
        };
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
}
