//! Feedback alignment learner.
//!
//! A dense learner whose input correction propagates the output error
//! through a fixed random feedback matrix instead of the transposed forward
//! weights. The forward weights still learn from the true local gradient;
//! only the path carrying error back to the input is randomized, which is
//! the feedback-alignment credit-assignment rule.

use crate::assess::{Assessment, MseLoss, Reduction};
use crate::error::{Result, TelosError};
use crate::io::IO;
use crate::machine::{
    AccLearningMachine, LearningMachine, MachineBase, MachineId, Phase, FIELD_Y,
};
use crate::optim::{Optimizer, Param, Parameterized, Sgd};
use crate::state::State;
use ndarray::{ArrayD, Axis, Ix2, IxDyn};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;

/// Accumulating dense learner with a fixed random feedback path.
pub struct FaLinearLearner {
    base: MachineBase,
    w: Param,
    b: Param,
    /// Fixed random feedback matrix, same shape as `w`. Never updated.
    feedback: ArrayD<f32>,
    loss: MseLoss,
    optim: Sgd,
}

impl FaLinearLearner {
    /// A feedback-alignment learner over `in_features -> out_features`.
    pub fn new(in_features: usize, out_features: usize, lr: f32, seed: u64) -> Self {
        let mut base = MachineBase::new(seed);
        let w = Param::kaiming(in_features, out_features, base.rng());
        let std = 1.0 / (out_features as f32).sqrt();
        let feedback = ArrayD::random_using(
            IxDyn(&[in_features, out_features]),
            Normal::new(0.0, std).unwrap(),
            base.rng(),
        );
        Self {
            base,
            w,
            b: Param::zeros(&[out_features]),
            feedback,
            loss: MseLoss::new(Reduction::Mean),
            optim: Sgd::new(lr),
        }
    }

    /// The fixed feedback matrix.
    pub fn feedback(&self) -> &ArrayD<f32> {
        &self.feedback
    }
}

impl LearningMachine for FaLinearLearner {
    fn id(&self) -> MachineId {
        self.base.id()
    }

    fn forward(&mut self, x: &IO, state: &mut State, release: bool) -> Result<IO> {
        x.freshen();
        let x2 = x.f()?.to_array().into_dimensionality::<Ix2>()?;
        let w2 = self.w.w.view().into_dimensionality::<Ix2>()?;
        let y = IO::from_array((x2.dot(&w2) + &self.b.w.view()).into_dyn());
        state.set_io(self.id(), Some(x.id()), FIELD_Y, y.clone());
        state.set_phase(self.id(), Some(x.id()), Phase::Forwarded);
        Ok(y.out(release))
    }

    fn assess_y(
        &self,
        y: &IO,
        t: &IO,
        reduction_override: Option<Reduction>,
    ) -> Result<Assessment> {
        self.loss.assess(y, t, reduction_override)
    }

    fn step(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<()> {
        let _ = t;
        state.require_phase(self.id(), Some(x.id()), Phase::Accumulated, "step", "accumulate")?;
        self.optim.step(&mut [&mut self.w, &mut self.b])?;
        self.optim.zero_grad(&mut [&mut self.w, &mut self.b])?;
        state.set_phase(self.id(), Some(x.id()), Phase::Stepped);
        Ok(())
    }

    fn step_x(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<IO> {
        let _ = t;
        state.require_phase(
            self.id(),
            Some(x.id()),
            Phase::Accumulated,
            "step_x",
            "accumulate",
        )?;
        let grad = x.f()?.grad().ok_or(TelosError::MissingGrad(0))?;
        Ok(IO::from_array(x.f()?.to_array() - grad))
    }
}

impl AccLearningMachine for FaLinearLearner {
    fn accumulate(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<()> {
        state.require_phase(
            self.id(),
            Some(x.id()),
            Phase::Forwarded,
            "accumulate",
            "forward",
        )?;
        let y = state.require_io(self.id(), Some(x.id()), FIELD_Y)?;
        let mut dy = self.loss.grad_y(&y, &t.detached(), None)?;
        let dy2 = dy.remove(0).into_dimensionality::<Ix2>()?;

        let x2 = x.f()?.to_array().into_dimensionality::<Ix2>()?;
        self.w.g += &x2.t().dot(&dy2).into_dyn();
        self.b.g += &dy2.sum_axis(Axis(0)).into_dyn();

        // The error reaches the input through the fixed feedback matrix,
        // not through the forward weights.
        let fb2 = self.feedback.view().into_dimensionality::<Ix2>()?;
        x.f()?.add_grad(&dy2.dot(&fb2.t()).into_dyn());

        state.set_phase(self.id(), Some(x.id()), Phase::Accumulated);
        Ok(())
    }
}

impl Parameterized for FaLinearLearner {
    fn parameters(&self) -> Vec<&Param> {
        vec![&self.w, &self.b]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w, &mut self.b]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::parameter_vector;
    use ndarray_rand::rand_distr::Uniform;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rand_io(rows: usize, cols: usize, seed: u64) -> IO {
        let mut rng = StdRng::seed_from_u64(seed);
        IO::from_array(
            ArrayD::random_using(vec![rows, cols], Uniform::new(0.0, 1.0), &mut rng),
        )
    }

    #[test]
    fn test_fa_updates_parameters() {
        let mut learner = FaLinearLearner::new(3, 4, 0.01, 20);
        let mut state = State::new();
        let x = rand_io(3, 3, 21);
        let t = rand_io(3, 4, 22);

        learner.forward(&x, &mut state, true).unwrap();
        learner.accumulate(&x, &t, &mut state).unwrap();
        let before = parameter_vector(&learner);
        learner.step(&x, &t, &mut state).unwrap();
        assert!(parameter_vector(&learner)
            .iter()
            .zip(before.iter())
            .any(|(a, b)| a != b));
    }

    #[test]
    fn test_fa_backpropagates_through_feedback() {
        let mut learner = FaLinearLearner::new(3, 4, 0.01, 23);
        let mut state = State::new();
        let x = rand_io(3, 3, 24);
        let t = rand_io(3, 4, 25);

        learner.forward(&x, &mut state, true).unwrap();
        learner.accumulate(&x, &t, &mut state).unwrap();
        let x_prime = learner.step_x(&x, &t, &mut state).unwrap();
        assert_eq!(x_prime.f().unwrap().shape(), vec![3, 3]);
        assert_ne!(x_prime.f().unwrap().to_array(), x.f().unwrap().to_array());

        // The feedback path, not the forward weights, carried the error.
        let grad = x.f().unwrap().grad().unwrap();
        let dy = learner
            .loss
            .grad_y(
                &state.require_io(learner.id(), Some(x.id()), FIELD_Y).unwrap(),
                &t.detached(),
                None,
            )
            .unwrap()
            .remove(0)
            .into_dimensionality::<Ix2>()
            .unwrap();
        let fb2 = learner.feedback().view().into_dimensionality::<Ix2>().unwrap();
        assert_eq!(grad, dy.dot(&fb2.t()).into_dyn());
    }

    #[test]
    fn test_fa_guards_ordering() {
        let mut learner = FaLinearLearner::new(3, 4, 0.01, 26);
        let mut state = State::new();
        let x = rand_io(3, 3, 27);
        let t = rand_io(3, 4, 28);

        learner.forward(&x, &mut state, true).unwrap();
        assert!(matches!(
            learner.step(&x, &t, &mut state),
            Err(TelosError::PreconditionNotMet { .. })
        ));
    }
}
