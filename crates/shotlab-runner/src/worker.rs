use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use shotlab_core::{AnalysisStats, StatsError, Task};
use shotlab_dem::{CompiledDecoder, DecoderRegistry, DemSampler, DetectorErrorModel, Sampler};
use thiserror::Error;

/// A sub-batch that could not be evaluated. The task is marked failed and
/// the run continues with the others.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("task {strong_id} (decoder {decoder}) failed: {message}")]
pub struct WorkerError {
    pub strong_id: String,
    pub decoder: String,
    pub message: String,
}

/// A task with its error model parsed and decoder compiled, shared by all
/// workers.
pub struct PreparedTask {
    pub task: Task,
    pub dem: DetectorErrorModel,
    decoder: Box<dyn CompiledDecoder>,
}

impl PreparedTask {
    pub fn new(task: Task, registry: &DecoderRegistry) -> Result<Self, StatsError> {
        let dem = DetectorErrorModel::parse(task.circuit()).map_err(|e| {
            StatsError::Config(format!(
                "circuit for task {} is not a valid error model: {}",
                task.strong_id(),
                e
            ))
        })?;
        if let Some(&d) = task
            .postselected_detectors()
            .iter()
            .find(|&&d| d >= dem.num_detectors)
        {
            return Err(StatsError::Config(format!(
                "postselected detector D{} is outside the {} detectors of task {}",
                d,
                dem.num_detectors,
                task.strong_id()
            )));
        }
        let decoder = registry
            .get(task.decoder())
            .and_then(|d| d.compile(&dem))
            .map_err(|e| StatsError::Config(e.to_string()))?;
        Ok(Self { task, dem, decoder })
    }
}

impl std::fmt::Debug for PreparedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedTask")
            .field("strong_id", &self.task.strong_id())
            .field("decoder", &self.task.decoder())
            .field("num_detectors", &self.dem.num_detectors)
            .finish()
    }
}

/// Samples and decodes sub-batches. Each worker owns its random stream.
pub struct Worker {
    rng: ChaCha8Rng,
}

impl Worker {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Runs `shots` shots of `prepared`. Panics in the sampler or decoder
    /// are reported as a [`WorkerError`].
    pub fn run(&mut self, prepared: &PreparedTask, shots: u64) -> Result<AnalysisStats, WorkerError> {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.evaluate(prepared, shots)));
        let message = match outcome {
            Ok(Ok(mut stats)) => {
                stats.seconds = started.elapsed().as_secs_f64();
                return Ok(stats);
            }
            Ok(Err(message)) => message,
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };
        Err(WorkerError {
            strong_id: prepared.task.strong_id().to_string(),
            decoder: prepared.task.decoder().to_string(),
            message,
        })
    }

    fn evaluate(&mut self, prepared: &PreparedTask, shots: u64) -> Result<AnalysisStats, String> {
        let postselected = prepared.task.postselected_detectors();
        let mut sampler = DemSampler::new(&prepared.dem, &mut self.rng);
        let mut stats = AnalysisStats::default();
        for shot in sampler.sample(shots as usize) {
            stats.shots += 1;
            if shot
                .detectors
                .iter()
                .any(|d| postselected.binary_search(d).is_ok())
            {
                stats.discards += 1;
                continue;
            }
            let predicted = prepared
                .decoder
                .decode(&shot.detectors)
                .map_err(|e| e.to_string())?;
            if predicted != shot.observables {
                stats.errors += 1;
            }
        }
        Ok(stats)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shotlab_core::Targets;

    fn prepared(circuit: &str, decoder: &str, postselected: Vec<u32>) -> PreparedTask {
        let task = Task::with_postselection(
            circuit.to_string(),
            decoder.to_string(),
            json!({"case": circuit}),
            postselected,
            Targets::new(100, None).expect("targets"),
        );
        PreparedTask::new(task, &DecoderRegistry::default()).expect("prepare")
    }

    #[test]
    fn certain_error_is_always_corrected_by_greedy() {
        let p = prepared("error(1) D0 L0", "greedy", Vec::new());
        let stats = Worker::new(1).run(&p, 50).expect("run");
        assert_eq!((stats.shots, stats.errors, stats.discards), (50, 0, 0));
        assert!(stats.seconds >= 0.0);
    }

    #[test]
    fn vacuous_decoder_misses_every_flip() {
        let p = prepared("error(1) D0 L0", "vacuous", Vec::new());
        let stats = Worker::new(1).run(&p, 40).expect("run");
        assert_eq!((stats.shots, stats.errors), (40, 40));
    }

    #[test]
    fn postselected_detectors_discard_shots() {
        let p = prepared("error(1) D0 L0\nerror(0) D1", "vacuous", vec![0]);
        let stats = Worker::new(3).run(&p, 30).expect("run");
        assert_eq!((stats.shots, stats.errors, stats.discards), (30, 0, 30));
    }

    #[test]
    fn invalid_circuit_and_detector_are_config_errors() {
        let task = Task::new(
            "error(2) D0".to_string(),
            "greedy".to_string(),
            json!({}),
            Targets::new(1, None).expect("targets"),
        );
        assert!(matches!(
            PreparedTask::new(task, &DecoderRegistry::default()),
            Err(StatsError::Config(_))
        ));

        let task = Task::with_postselection(
            "error(0.1) D0".to_string(),
            "greedy".to_string(),
            json!({}),
            vec![4],
            Targets::new(1, None).expect("targets"),
        );
        assert!(matches!(
            PreparedTask::new(task, &DecoderRegistry::default()),
            Err(StatsError::Config(_))
        ));
    }

    #[test]
    fn decoder_panic_becomes_worker_error() {
        struct Panicking;
        struct PanickingCompiled;
        impl shotlab_dem::Decoder for Panicking {
            fn name(&self) -> &str {
                "panicking"
            }
            fn compile(
                &self,
                _dem: &DetectorErrorModel,
            ) -> Result<Box<dyn CompiledDecoder>, shotlab_dem::DecodeError> {
                Ok(Box::new(PanickingCompiled))
            }
        }
        impl CompiledDecoder for PanickingCompiled {
            fn decode(&self, _detectors: &[u32]) -> Result<u64, shotlab_dem::DecodeError> {
                panic!("decoder blew up")
            }
        }

        let mut registry = DecoderRegistry::default();
        registry.register(std::sync::Arc::new(Panicking));
        let task = Task::new(
            "error(0.5) D0 L0".to_string(),
            "panicking".to_string(),
            json!({}),
            Targets::new(10, None).expect("targets"),
        );
        let p = PreparedTask::new(task, &registry).expect("prepare");
        let err = Worker::new(0).run(&p, 10).expect_err("panic");
        assert_eq!(err.decoder, "panicking");
        assert!(err.message.contains("decoder blew up"), "{}", err.message);
    }
}
