use rand::Rng;

use crate::dem::DetectorErrorModel;

/// Outcome of one simulated shot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shot {
    /// Fired detectors, sorted ascending.
    pub detectors: Vec<u32>,
    /// Bit `k` set when observable `k` flipped.
    pub observables: u64,
}

/// Draws shots of a circuit.
pub trait Sampler {
    fn sample(&mut self, shots: usize) -> Vec<Shot>;
}

/// Samples a detector error model by firing each mechanism independently.
pub struct DemSampler<'a, R: Rng> {
    dem: &'a DetectorErrorModel,
    rng: R,
    fired: Vec<bool>,
    touched: Vec<u32>,
}

impl<'a, R: Rng> DemSampler<'a, R> {
    pub fn new(dem: &'a DetectorErrorModel, rng: R) -> Self {
        Self {
            dem,
            rng,
            fired: vec![false; dem.num_detectors as usize],
            touched: Vec::new(),
        }
    }

    fn sample_one(&mut self) -> Shot {
        let dem = self.dem;
        let mut observables = 0u64;
        for mechanism in &dem.mechanisms {
            if mechanism.probability <= 0.0 || self.rng.gen::<f64>() >= mechanism.probability {
                continue;
            }
            for &d in &mechanism.detectors {
                self.fired[d as usize] ^= true;
                self.touched.push(d);
            }
            observables ^= mechanism.observables;
        }
        self.touched.sort_unstable();
        self.touched.dedup();
        let mut detectors = Vec::new();
        for &d in &self.touched {
            if self.fired[d as usize] {
                detectors.push(d);
                self.fired[d as usize] = false;
            }
        }
        self.touched.clear();
        Shot {
            detectors,
            observables,
        }
    }
}

impl<'a, R: Rng> Sampler for DemSampler<'a, R> {
    fn sample(&mut self, shots: usize) -> Vec<Shot> {
        (0..shots).map(|_| self.sample_one()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn certain_errors_always_fire() {
        let dem = DetectorErrorModel::parse("error(1) D0 D2 L0\nerror(0) D1 L1").expect("parse");
        let mut sampler = DemSampler::new(&dem, ChaCha8Rng::seed_from_u64(7));
        for shot in sampler.sample(20) {
            assert_eq!(shot.detectors, vec![0, 2]);
            assert_eq!(shot.observables, 1);
        }
    }

    #[test]
    fn overlapping_mechanisms_cancel() {
        let dem = DetectorErrorModel::parse("error(1) D0 D1 L0\nerror(1) D1 D2 L0").expect("parse");
        let mut sampler = DemSampler::new(&dem, ChaCha8Rng::seed_from_u64(1));
        let shot = &sampler.sample(1)[0];
        assert_eq!(shot.detectors, vec![0, 2]);
        assert_eq!(shot.observables, 0);
    }

    #[test]
    fn same_seed_same_shots() {
        let dem = DetectorErrorModel::parse("error(0.3) D0 L0\nerror(0.2) D0 D1").expect("parse");
        let a = DemSampler::new(&dem, ChaCha8Rng::seed_from_u64(99)).sample(200);
        let b = DemSampler::new(&dem, ChaCha8Rng::seed_from_u64(99)).sample(200);
        let c = DemSampler::new(&dem, ChaCha8Rng::seed_from_u64(100)).sample(200);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn firing_rate_tracks_probability() {
        let dem = DetectorErrorModel::parse("error(0.25) D0 L0").expect("parse");
        let shots = DemSampler::new(&dem, ChaCha8Rng::seed_from_u64(3)).sample(20_000);
        let fired = shots.iter().filter(|s| s.observables == 1).count();
        assert!((4_000..6_000).contains(&fired), "fired {} times", fired);
        assert!(shots
            .iter()
            .all(|s| (s.observables == 1) == (s.detectors == vec![0])));
    }
}
