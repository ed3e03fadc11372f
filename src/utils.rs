//! Parameter vector utilities.
//!
//! Flattened views over a machine's parameters and gradients, mainly used to
//! observe that an update actually changed something.

use crate::optim::Parameterized;
use ndarray::Array1;

/// All weights of `machine` flattened into one vector, in parameter order.
pub fn parameter_vector(machine: &dyn Parameterized) -> Array1<f32> {
    let mut out = Vec::new();
    for param in machine.parameters() {
        out.extend(param.w.iter().copied());
    }
    Array1::from(out)
}

/// All gradients of `machine` flattened into one vector, in parameter order.
pub fn grad_vector(machine: &dyn Parameterized) -> Array1<f32> {
    let mut out = Vec::new();
    for param in machine.parameters() {
        out.extend(param.g.iter().copied());
    }
    Array1::from(out)
}
