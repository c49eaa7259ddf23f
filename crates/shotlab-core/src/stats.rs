use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Additive counters for one experiment.
///
/// Only raw counts are stored. Rates are derived on demand so that repeated
/// merges stay exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub shots: u64,
    pub errors: u64,
    pub discards: u64,
    pub seconds: f64,
}

impl AnalysisStats {
    pub fn new(shots: u64, errors: u64, discards: u64, seconds: f64) -> Self {
        Self {
            shots,
            errors,
            discards,
            seconds,
        }
    }

    /// Element-wise sum. `None` when a count would overflow `u64`.
    pub fn merge(&self, other: &AnalysisStats) -> Option<AnalysisStats> {
        Some(AnalysisStats {
            shots: self.shots.checked_add(other.shots)?,
            errors: self.errors.checked_add(other.errors)?,
            discards: self.discards.checked_add(other.discards)?,
            seconds: self.seconds + other.seconds,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.shots == 0 && self.errors == 0 && self.discards == 0 && self.seconds == 0.0
    }

    /// Checks `errors + discards <= shots` and that `seconds` is a finite,
    /// non-negative number.
    pub fn validate(&self) -> Result<(), String> {
        let classified = self.errors.checked_add(self.discards);
        if classified.map_or(true, |n| n > self.shots) {
            return Err(format!(
                "errors ({}) + discards ({}) exceeds shots ({})",
                self.errors, self.discards, self.shots
            ));
        }
        if !self.seconds.is_finite() || self.seconds < 0.0 {
            return Err(format!("seconds must be finite and >= 0, got {}", self.seconds));
        }
        Ok(())
    }

    /// Shots that were not discarded.
    pub fn kept_shots(&self) -> u64 {
        self.shots.saturating_sub(self.discards)
    }

    /// `None` when no shot survived postselection.
    pub fn error_rate(&self) -> Option<f64> {
        match self.kept_shots() {
            0 => None,
            kept => Some(self.errors as f64 / kept as f64),
        }
    }

    pub fn discard_rate(&self) -> Option<f64> {
        match self.shots {
            0 => None,
            shots => Some(self.discards as f64 / shots as f64),
        }
    }
}

/// One row of a stats table: an experiment's identity plus its counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub strong_id: String,
    pub decoder: String,
    pub json_metadata: Value,
    pub stats: AnalysisStats,
}

impl TaskStats {
    pub fn error_rate(&self) -> Option<f64> {
        self.stats.error_rate()
    }

    pub fn discard_rate(&self) -> Option<f64> {
        self.stats.discard_rate()
    }
}
