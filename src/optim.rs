//! Optimizer collaborators - Parameters and the update interface.
//!
//! A [`Param`] pairs a weight array with its gradient accumulator. Machines
//! own their parameters and an [`Optimizer`]; the framework only sequences
//! `zero_grad()` and `step()` calls around the reverse pass; optimizer
//! internals are a collaborator concern, not a framework one.

use crate::error::Result;
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// A weight array together with its accumulated gradient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    /// Weights.
    pub w: ArrayD<f32>,
    /// Accumulated gradient, same shape as `w`.
    pub g: ArrayD<f32>,
}

impl Param {
    /// Zero-initialized parameter.
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            w: ArrayD::zeros(IxDyn(shape)),
            g: ArrayD::zeros(IxDyn(shape)),
        }
    }

    /// Normally-initialized parameter with standard deviation `std`.
    pub fn randn(shape: &[usize], std: f32, rng: &mut StdRng) -> Self {
        Self {
            w: ArrayD::random_using(IxDyn(shape), Normal::new(0.0, std).unwrap(), rng),
            g: ArrayD::zeros(IxDyn(shape)),
        }
    }

    /// Kaiming-style init for a `rows x cols` weight fed by `rows` features.
    pub fn kaiming(rows: usize, cols: usize, rng: &mut StdRng) -> Self {
        let std = (2.0 / rows as f32).sqrt();
        Self::randn(&[rows, cols], std, rng)
    }

    /// Clear the accumulated gradient.
    pub fn zero_grad(&mut self) {
        self.g.fill(0.0);
    }

    /// Number of scalar weights.
    pub fn numel(&self) -> usize {
        self.w.len()
    }
}

/// The update interface the framework sequences.
pub trait Optimizer {
    /// Clear the gradient accumulators of `params`.
    fn zero_grad(&mut self, params: &mut [&mut Param]) -> Result<()>;

    /// Apply one update to `params` from their accumulated gradients.
    fn step(&mut self, params: &mut [&mut Param]) -> Result<()>;
}

/// Plain stochastic gradient descent.
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    lr: f32,
}

impl Sgd {
    /// SGD with learning rate `lr`.
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }

    /// The learning rate.
    pub fn lr(&self) -> f32 {
        self.lr
    }
}

impl Optimizer for Sgd {
    fn zero_grad(&mut self, params: &mut [&mut Param]) -> Result<()> {
        for param in params.iter_mut() {
            param.zero_grad();
        }
        Ok(())
    }

    fn step(&mut self, params: &mut [&mut Param]) -> Result<()> {
        for param in params.iter_mut() {
            param.w.scaled_add(-self.lr, &param.g);
        }
        Ok(())
    }
}

/// Machines whose parameters can be enumerated.
///
/// Used by the parameter-vector utilities and by anything that needs to
/// observe or checkpoint a machine's weights.
pub trait Parameterized {
    /// Immutable views of every parameter, in a stable order.
    fn parameters(&self) -> Vec<&Param>;

    /// Mutable views of every parameter, in the same order.
    fn parameters_mut(&mut self) -> Vec<&mut Param>;
}
