//! Deferred parameter updates over stacked inputs.
//!
//! `StackedStep` postpones a wrapped machine's update: each `step` call
//! only records the `(x, t)` pair in state, and `flush` concatenates the
//! recorded pairs into one batch, runs the wrapped machine forward over it
//! and applies a single update. Useful when a layer is reused several times
//! in one pass and should be updated once from all of its visits.

use crate::error::{Result, TelosError};
use crate::io::IO;
use crate::machine::{LearningMachine, MachineBase, MachineId};
use crate::state::State;
use std::cell::RefCell;
use std::rc::Rc;

const STACK_X: &str = "stack_x";
const STACK_T: &str = "stack_t";

/// Wrapper deferring a machine's `step` until `flush`.
pub struct StackedStep {
    base: MachineBase,
    inner: Rc<RefCell<dyn LearningMachine>>,
}

impl StackedStep {
    /// Defer updates of `inner`.
    pub fn new(inner: Rc<RefCell<dyn LearningMachine>>) -> Self {
        Self {
            base: MachineBase::new(0),
            inner,
        }
    }

    /// This wrapper's own id, under which the stacks are keyed.
    pub fn id(&self) -> MachineId {
        self.base.id()
    }

    /// Record one `(x, t)` pair for the deferred update.
    pub fn step(&self, x: &IO, t: &IO, state: &mut State) {
        state.push_io(self.id(), None, STACK_X, x.clone());
        state.push_io(self.id(), None, STACK_T, t.clone());
    }

    /// Concatenate everything recorded so far, forward the wrapped machine
    /// over the combined batch and apply one update.
    ///
    /// Fails if nothing was recorded.
    pub fn flush(&self, state: &mut State) -> Result<()> {
        let xs = state
            .take_io_list(self.id(), None, STACK_X)
            .ok_or(TelosError::PreconditionNotMet {
                op: "flush",
                requires: "step",
            })?;
        let ts = state
            .take_io_list(self.id(), None, STACK_T)
            .ok_or(TelosError::PreconditionNotMet {
                op: "flush",
                requires: "step",
            })?;

        let x = IO::cat(&xs)?;
        let t = IO::cat(&ts)?;
        let mut inner = self.inner.borrow_mut();
        inner.forward(&x, state, false)?;
        inner.step(&x, &t, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machines::LinearLearner;
    use crate::utils::parameter_vector;
    use ndarray::ArrayD;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rand_io(rows: usize, cols: usize, seed: u64) -> IO {
        let mut rng = StdRng::seed_from_u64(seed);
        IO::from_array(
            ArrayD::random_using(vec![rows, cols], Uniform::new(0.0, 1.0), &mut rng),
        )
    }

    #[test]
    fn test_flush_applies_one_stacked_update() {
        let learner = Rc::new(RefCell::new(LinearLearner::new(3, 3, 0.1, 30)));
        let stacked = StackedStep::new(learner.clone());
        let mut state = State::new();

        stacked.step(&rand_io(2, 3, 31), &rand_io(2, 3, 32), &mut state);
        stacked.step(&rand_io(4, 3, 33), &rand_io(4, 3, 34), &mut state);

        let before = parameter_vector(&*learner.borrow());
        stacked.flush(&mut state).unwrap();
        let after = parameter_vector(&*learner.borrow());
        assert!(before.iter().zip(after.iter()).any(|(a, b)| a != b));

        // The stacks were consumed.
        assert!(matches!(
            stacked.flush(&mut state),
            Err(TelosError::PreconditionNotMet {
                op: "flush",
                requires: "step"
            })
        ));
    }

    #[test]
    fn test_flush_without_step_fails() {
        let learner = Rc::new(RefCell::new(LinearLearner::new(3, 3, 0.1, 35)));
        let stacked = StackedStep::new(learner);
        let mut state = State::new();
        assert!(stacked.flush(&mut state).is_err());
    }
}
