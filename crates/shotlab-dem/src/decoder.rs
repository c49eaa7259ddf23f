use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::dem::DetectorErrorModel;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("unknown decoder '{name}' (available: {available})")]
    UnknownDecoder { name: String, available: String },
    #[error("detector D{detector} is out of range for a model with {num_detectors} detectors")]
    DetectorOutOfRange { detector: u32, num_detectors: u32 },
    #[error("decoder failed: {0}")]
    Failed(String),
}

/// A decoding strategy that can be specialised to one error model.
pub trait Decoder: Send + Sync {
    fn name(&self) -> &str;

    fn compile(&self, dem: &DetectorErrorModel) -> Result<Box<dyn CompiledDecoder>, DecodeError>;
}

/// A decoder bound to one error model. Must be deterministic.
pub trait CompiledDecoder: Send + Sync {
    /// Predicts observable flips from the sorted list of fired detectors.
    fn decode(&self, detectors: &[u32]) -> Result<u64, DecodeError>;
}

/// Named decoders available to `collect` and `predict`.
#[derive(Clone)]
pub struct DecoderRegistry {
    decoders: BTreeMap<String, Arc<dyn Decoder>>,
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self {
            decoders: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, decoder: Arc<dyn Decoder>) {
        self.decoders.insert(decoder.name().to_string(), decoder);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Decoder>, DecodeError> {
        self.decoders
            .get(name)
            .cloned()
            .ok_or_else(|| DecodeError::UnknownDecoder {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.decoders.keys().cloned().collect()
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(GreedyDecoder));
        registry.register(Arc::new(VacuousDecoder));
        registry
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.decoders.keys()).finish()
    }
}

/// Always predicts that no observable flipped.
pub struct VacuousDecoder;

struct VacuousCompiled;

impl Decoder for VacuousDecoder {
    fn name(&self) -> &str {
        "vacuous"
    }

    fn compile(&self, _dem: &DetectorErrorModel) -> Result<Box<dyn CompiledDecoder>, DecodeError> {
        Ok(Box::new(VacuousCompiled))
    }
}

impl CompiledDecoder for VacuousCompiled {
    fn decode(&self, _detectors: &[u32]) -> Result<u64, DecodeError> {
        Ok(0)
    }
}

/// Exact lookup of single-mechanism syndromes, falling back to greedily
/// explaining the lowest fired detector with the mechanism that clears the
/// most fired detectors.
pub struct GreedyDecoder;

struct Candidate {
    detectors: Vec<u32>,
    observables: u64,
}

struct GreedyMatcher {
    num_detectors: u32,
    exact: HashMap<Vec<u32>, u64>,
    /// Ordered by probability, most likely first.
    candidates: Vec<Candidate>,
    by_detector: Vec<Vec<usize>>,
}

impl Decoder for GreedyDecoder {
    fn name(&self) -> &str {
        "greedy"
    }

    fn compile(&self, dem: &DetectorErrorModel) -> Result<Box<dyn CompiledDecoder>, DecodeError> {
        let mut order: Vec<usize> = (0..dem.mechanisms.len())
            .filter(|&i| {
                let m = &dem.mechanisms[i];
                m.probability > 0.0 && !m.detectors.is_empty()
            })
            .collect();
        // Stable sort keeps file order among equally likely mechanisms.
        order.sort_by(|&a, &b| {
            dem.mechanisms[b]
                .probability
                .total_cmp(&dem.mechanisms[a].probability)
        });

        let mut exact = HashMap::new();
        let mut candidates = Vec::with_capacity(order.len());
        let mut by_detector = vec![Vec::new(); dem.num_detectors as usize];
        for i in order {
            let m = &dem.mechanisms[i];
            exact.entry(m.detectors.clone()).or_insert(m.observables);
            for &d in &m.detectors {
                by_detector[d as usize].push(candidates.len());
            }
            candidates.push(Candidate {
                detectors: m.detectors.clone(),
                observables: m.observables,
            });
        }
        Ok(Box::new(GreedyMatcher {
            num_detectors: dem.num_detectors,
            exact,
            candidates,
            by_detector,
        }))
    }
}

impl CompiledDecoder for GreedyMatcher {
    fn decode(&self, detectors: &[u32]) -> Result<u64, DecodeError> {
        if let Some(&bad) = detectors.iter().find(|&&d| d >= self.num_detectors) {
            return Err(DecodeError::DetectorOutOfRange {
                detector: bad,
                num_detectors: self.num_detectors,
            });
        }
        if detectors.is_empty() {
            return Ok(0);
        }
        if let Some(&observables) = self.exact.get(detectors) {
            return Ok(observables);
        }

        let mut remaining: BTreeSet<u32> = detectors.iter().copied().collect();
        let mut prediction = 0u64;
        let mut steps = 0usize;
        let step_limit = 4 * detectors.len() + self.num_detectors as usize;
        while let Some(&lowest) = remaining.iter().next() {
            steps += 1;
            if steps > step_limit {
                break;
            }
            let mut best: Option<(i64, usize)> = None;
            for &c in &self.by_detector[lowest as usize] {
                let candidate = &self.candidates[c];
                let hits = candidate
                    .detectors
                    .iter()
                    .filter(|&&d| remaining.contains(&d))
                    .count() as i64;
                let score = 2 * hits - candidate.detectors.len() as i64;
                if best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, c));
                }
            }
            match best {
                Some((_, c)) => {
                    let candidate = &self.candidates[c];
                    for d in &candidate.detectors {
                        if !remaining.remove(d) {
                            remaining.insert(*d);
                        }
                    }
                    prediction ^= candidate.observables;
                }
                None => {
                    remaining.remove(&lowest);
                }
            }
        }
        Ok(prediction)
    }
}

/// Decodes each shot of `shots` against `dem` with the named decoder, in
/// input order.
pub fn predict_observables(
    registry: &DecoderRegistry,
    decoder: &str,
    dem: &DetectorErrorModel,
    shots: &[Vec<u32>],
) -> Result<Vec<u64>, DecodeError> {
    let compiled = registry.get(decoder)?.compile(dem)?;
    shots.iter().map(|shot| compiled.decode(shot)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(name: &str, text: &str) -> Box<dyn CompiledDecoder> {
        let dem = DetectorErrorModel::parse(text).expect("parse");
        DecoderRegistry::default()
            .get(name)
            .expect("decoder")
            .compile(&dem)
            .expect("compile")
    }

    #[test]
    fn single_error_model_predicts_flip() {
        let dec = compile("greedy", "error(0.1) D0 L0");
        assert_eq!(dec.decode(&[0]).expect("decode"), 1);
        assert_eq!(dec.decode(&[]).expect("decode"), 0);
    }

    #[test]
    fn exact_lookup_prefers_likelier_mechanism() {
        let dec = compile("greedy", "error(0.01) D0 D1 L0\nerror(0.2) D0 D1");
        assert_eq!(dec.decode(&[0, 1]).expect("decode"), 0);
    }

    #[test]
    fn greedy_explains_chain_of_errors() {
        // Repetition chain: boundary D0, bulk D0-D1, D1-D2, boundary D2 with L0.
        let dec = compile(
            "greedy",
            "error(0.1) D0\nerror(0.1) D0 D1\nerror(0.1) D1 D2\nerror(0.1) D2 L0",
        );
        assert_eq!(dec.decode(&[2]).expect("decode"), 1);
        assert_eq!(dec.decode(&[1]).expect("decode"), 0);
        assert_eq!(dec.decode(&[0, 1, 2]).expect("decode"), 1);
    }

    #[test]
    fn decode_is_deterministic() {
        let dec = compile(
            "greedy",
            "error(0.1) D0 D1 L0\nerror(0.1) D1 D2\nerror(0.1) D2 D3 L0\nerror(0.1) D3",
        );
        let shot = [0u32, 3];
        let first = dec.decode(&shot).expect("decode");
        for _ in 0..10 {
            assert_eq!(dec.decode(&shot).expect("decode"), first);
        }
    }

    #[test]
    fn out_of_range_detector_is_rejected() {
        let dec = compile("greedy", "error(0.1) D0 L0");
        assert!(matches!(
            dec.decode(&[5]),
            Err(DecodeError::DetectorOutOfRange { detector: 5, .. })
        ));
    }

    #[test]
    fn vacuous_never_predicts_flips() {
        let dec = compile("vacuous", "error(0.1) D0 L0");
        assert_eq!(dec.decode(&[0]).expect("decode"), 0);
    }

    #[test]
    fn unknown_decoder_lists_available() {
        let err = DecoderRegistry::default()
            .get("pymatching")
            .err()
            .expect("unknown");
        assert_eq!(
            err.to_string(),
            "unknown decoder 'pymatching' (available: greedy, vacuous)"
        );
    }

    #[test]
    fn predict_keeps_input_order() {
        let dem = DetectorErrorModel::parse("error(0.1) D0 L0").expect("parse");
        let preds = predict_observables(
            &DecoderRegistry::default(),
            "greedy",
            &dem,
            &[vec![0], vec![], vec![0]],
        )
        .expect("predict");
        assert_eq!(preds, vec![1, 0, 1]);
    }
}
