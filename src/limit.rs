//! Feature limiting - Restrict which features an update touches.
//!
//! A [`FeatureLimit`] produces an [`Idx`] selecting the subset of the
//! feature dimension to update in one iteration. Combined with
//! [`Idx::update`] this lets a caller apply partial updates to wide layers.

use crate::error::{Result, TelosError};
use crate::io::Idx;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;

/// Generates the per-iteration feature selection.
pub trait FeatureLimit {
    /// Sample the features to update this iteration.
    fn sample_limit(&mut self) -> Idx;
}

/// Uniformly random feature selection of fixed size.
pub struct RandomFeatureIdx {
    n_features: usize,
    choose_count: usize,
    rng: StdRng,
}

impl RandomFeatureIdx {
    /// Choose `choose_count` of `n_features` features per sample.
    pub fn new(n_features: usize, choose_count: usize, seed: u64) -> Result<Self> {
        if choose_count > n_features {
            return Err(TelosError::InvalidParameter(format!(
                "cannot choose {} features out of {}",
                choose_count, n_features
            )));
        }
        Ok(Self {
            n_features,
            choose_count,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// The number of features selected from.
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// The number of features chosen per sample.
    pub fn choose_count(&self) -> usize {
        self.choose_count
    }
}

impl FeatureLimit for RandomFeatureIdx {
    fn sample_limit(&mut self) -> Idx {
        let chosen = sample(&mut self.rng, self.n_features, self.choose_count).into_vec();
        // Feature dimension, not batch dimension.
        Idx::new(chosen, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_overlarge_choice() {
        assert!(RandomFeatureIdx::new(3, 4, 0).is_err());
    }

    #[test]
    fn test_samples_requested_count() {
        let mut limit = RandomFeatureIdx::new(10, 4, 1).unwrap();
        let idx = limit.sample_limit();
        assert_eq!(idx.len(), Some(4));
        assert_eq!(idx.dim(), 1);

        let indices = idx.indices().unwrap().to_vec();
        assert!(indices.iter().all(|&i| i < 10));
        let mut unique = indices.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), indices.len());
    }

    #[test]
    fn test_seed_determinism() {
        let mut a = RandomFeatureIdx::new(16, 8, 42).unwrap();
        let mut b = RandomFeatureIdx::new(16, 8, 42).unwrap();
        assert_eq!(a.sample_limit(), b.sample_limit());
    }
}
