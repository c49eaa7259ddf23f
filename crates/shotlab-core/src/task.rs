use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, StatsError};
use crate::stats::AnalysisStats;
use crate::{canonical_json, sha256_hex};

/// Per-task stopping targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    pub max_shots: u64,
    /// `None` lets only the shot budget end collection.
    #[serde(default)]
    pub max_errors: Option<u64>,
}

impl Targets {
    pub fn new(max_shots: u64, max_errors: Option<u64>) -> Result<Self> {
        if max_shots == 0 {
            return Err(StatsError::Config("max_shots must be at least 1".to_string()));
        }
        if max_errors == Some(0) {
            return Err(StatsError::Config(
                "max_errors must be at least 1 when given".to_string(),
            ));
        }
        Ok(Self {
            max_shots,
            max_errors,
        })
    }
}

/// Which budget ended collection for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    Errors,
    Shots,
}

/// Work still needed for a task to reach its targets.
///
/// Once either budget is used up the other is zeroed too, so a complete
/// task always has zero deficit on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkDeficit {
    pub remaining_shots: u64,
    /// `None` when the task has no error target.
    pub remaining_errors: Option<u64>,
    pub exhausted: Option<Exhausted>,
}

impl WorkDeficit {
    pub fn between(targets: &Targets, collected: &AnalysisStats) -> Self {
        let remaining_shots = targets.max_shots.saturating_sub(collected.shots);
        let remaining_errors = targets
            .max_errors
            .map(|max| max.saturating_sub(collected.errors));
        let exhausted = if remaining_errors == Some(0) {
            Some(Exhausted::Errors)
        } else if remaining_shots == 0 {
            Some(Exhausted::Shots)
        } else {
            None
        };
        match exhausted {
            Some(_) => Self {
                remaining_shots: 0,
                remaining_errors: remaining_errors.map(|_| 0),
                exhausted,
            },
            None => Self {
                remaining_shots,
                remaining_errors,
                exhausted,
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.exhausted.is_some()
    }
}

/// One sampling unit: a circuit decoded by one decoder, tagged with metadata.
///
/// Immutable once built. The strong id is computed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    circuit: String,
    decoder: String,
    json_metadata: Value,
    postselected_detectors: Vec<u32>,
    targets: Targets,
    strong_id: String,
}

impl Task {
    pub fn new(
        circuit: impl Into<String>,
        decoder: impl Into<String>,
        json_metadata: Value,
        targets: Targets,
    ) -> Self {
        Self::with_postselection(circuit, decoder, json_metadata, Vec::new(), targets)
    }

    /// Shots where any of `postselected_detectors` fires are discarded.
    pub fn with_postselection(
        circuit: impl Into<String>,
        decoder: impl Into<String>,
        json_metadata: Value,
        mut postselected_detectors: Vec<u32>,
        targets: Targets,
    ) -> Self {
        postselected_detectors.sort_unstable();
        postselected_detectors.dedup();
        let circuit = circuit.into();
        let decoder = decoder.into();
        let strong_id = strong_id(&circuit, &decoder, &json_metadata, &postselected_detectors);
        Self {
            circuit,
            decoder,
            json_metadata,
            postselected_detectors,
            targets,
            strong_id,
        }
    }

    pub fn circuit(&self) -> &str {
        &self.circuit
    }

    pub fn decoder(&self) -> &str {
        &self.decoder
    }

    pub fn json_metadata(&self) -> &Value {
        &self.json_metadata
    }

    pub fn postselected_detectors(&self) -> &[u32] {
        &self.postselected_detectors
    }

    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    pub fn strong_id(&self) -> &str {
        &self.strong_id
    }

    pub fn deficit(&self, collected: &AnalysisStats) -> WorkDeficit {
        WorkDeficit::between(&self.targets, collected)
    }
}

/// SHA-256 over the canonical JSON of everything that defines an experiment.
pub fn strong_id(
    circuit: &str,
    decoder: &str,
    json_metadata: &Value,
    postselected_detectors: &[u32],
) -> String {
    let mut doc = json!({
        "circuit": circuit,
        "decoder": decoder,
        "json_metadata": json_metadata,
    });
    if !postselected_detectors.is_empty() {
        doc["postselected_detectors"] = json!(postselected_detectors);
    }
    sha256_hex(canonical_json(&doc).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> Targets {
        Targets::new(1000, Some(10)).expect("targets")
    }

    #[test]
    fn strong_id_is_stable_and_hex() {
        let a = Task::new("error(0.1) D0 L0\n", "greedy", json!({"d": 3}), targets());
        let b = Task::new("error(0.1) D0 L0\n", "greedy", json!({"d": 3}), targets());
        assert_eq!(a.strong_id(), b.strong_id());
        assert_eq!(a.strong_id().len(), 64);
        assert!(a.strong_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn strong_id_changes_with_each_input() {
        let base = Task::new("error(0.1) D0 L0\n", "greedy", json!({"d": 3}), targets());
        let other_decoder = Task::new("error(0.1) D0 L0\n", "vacuous", json!({"d": 3}), targets());
        let other_circuit = Task::new("error(0.2) D0 L0\n", "greedy", json!({"d": 3}), targets());
        let other_metadata = Task::new("error(0.1) D0 L0\n", "greedy", json!({"d": 5}), targets());
        let postselected = Task::with_postselection(
            "error(0.1) D0 L0\n",
            "greedy",
            json!({"d": 3}),
            vec![0],
            targets(),
        );
        for other in [&other_decoder, &other_circuit, &other_metadata, &postselected] {
            assert_ne!(base.strong_id(), other.strong_id());
        }
    }

    #[test]
    fn strong_id_ignores_metadata_key_order_and_targets() {
        let a: Value = serde_json::from_str(r#"{"p":0.01,"d":3}"#).expect("json");
        let b: Value = serde_json::from_str(r#"{"d":3,"p":0.01}"#).expect("json");
        let t1 = Task::new("c", "greedy", a, targets());
        let t2 = Task::new("c", "greedy", b, Targets::new(5, None).expect("targets"));
        assert_eq!(t1.strong_id(), t2.strong_id());
    }

    #[test]
    fn deficit_tracks_both_budgets() {
        let t = targets();
        let d = WorkDeficit::between(&t, &AnalysisStats::new(400, 3, 0, 1.0));
        assert_eq!(d.remaining_shots, 600);
        assert_eq!(d.remaining_errors, Some(7));
        assert!(!d.is_complete());

        let d = WorkDeficit::between(&t, &AnalysisStats::new(1200, 3, 0, 1.0));
        assert_eq!(d.exhausted, Some(Exhausted::Shots));
        assert_eq!((d.remaining_shots, d.remaining_errors), (0, Some(0)));

        let d = WorkDeficit::between(&t, &AnalysisStats::new(50, 12, 0, 1.0));
        assert_eq!(d.exhausted, Some(Exhausted::Errors));
        assert_eq!(d.remaining_shots, 0);
    }

    #[test]
    fn deficit_without_error_target_only_counts_shots() {
        let t = Targets::new(100, None).expect("targets");
        let d = WorkDeficit::between(&t, &AnalysisStats::new(10, 10, 0, 0.0));
        assert_eq!(d.remaining_shots, 90);
        assert_eq!(d.remaining_errors, None);
    }

    #[test]
    fn targets_reject_zero_budgets() {
        assert!(matches!(Targets::new(0, None), Err(StatsError::Config(_))));
        assert!(matches!(Targets::new(10, Some(0)), Err(StatsError::Config(_))));
    }
}
