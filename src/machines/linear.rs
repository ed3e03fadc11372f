//! Linear learning machines with local gradient rules.
//!
//! Both machines carry their own backward formulas for a dense layer
//! (`dW = xᵀ·dy`, `db = Σ dy`, `dx = dy·Wᵀ`); nothing here asks the
//! substrate to differentiate.
//!
//! [`LinearLearner`] is the plain machine: `step` derives and applies the
//! update in one call and `step_x` is a pure function of the cached forward
//! output. [`AccLinearLearner`] decouples the two: `accumulate` writes
//! parameter and input gradients, `step` applies the optimizer, and both
//! `step` and `step_x` are guarded on accumulation having run.

use crate::assess::{Assessment, MseLoss, Reduction};
use crate::error::{Result, TelosError};
use crate::io::IO;
use crate::machine::{
    AccLearningMachine, LearningMachine, MachineBase, MachineId, Phase, FIELD_Y,
};
use crate::optim::{Optimizer, Param, Parameterized, Sgd};
use crate::state::State;
use ndarray::{Array2, ArrayD, Axis, Ix2};
use std::fs::File;
use std::path::Path;

/// Sum a multi-value input and project it through `w`, `b`.
fn project(x: &IO, w: &Param, b: &Param) -> Result<ArrayD<f32>> {
    let x2: Array2<f32> = summed_input(x)?.into_dimensionality::<Ix2>()?;
    let w2 = w.w.view().into_dimensionality::<Ix2>()?;
    let b1 = b.w.view();
    Ok((x2.dot(&w2) + &b1).into_dyn())
}

/// `(dW, db, dx)` for a dense layer given the summed input and `dy`.
fn linear_grads(
    x_sum: &ArrayD<f32>,
    w: &Param,
    dy: &ArrayD<f32>,
) -> Result<(ArrayD<f32>, ArrayD<f32>, ArrayD<f32>)> {
    let x2 = x_sum.view().into_dimensionality::<Ix2>()?;
    let w2 = w.w.view().into_dimensionality::<Ix2>()?;
    let dy2 = dy.view().into_dimensionality::<Ix2>()?;

    let dw = x2.t().dot(&dy2).into_dyn();
    let db = dy2.sum_axis(Axis(0)).into_dyn();
    let dx = dy2.dot(&w2.t()).into_dyn();
    Ok((dw, db, dx))
}

fn summed_input(x: &IO) -> Result<ArrayD<f32>> {
    let mut summed = x.f()?.to_array();
    for v in x.values().iter().skip(1) {
        summed += &*v.data();
    }
    Ok(summed)
}

/// Plain linear machine: update derived and applied in one `step`.
pub struct LinearLearner {
    base: MachineBase,
    w: Param,
    b: Param,
    loss: MseLoss,
    optim: Sgd,
}

impl LinearLearner {
    /// A dense layer learner over `in_features -> out_features`.
    pub fn new(in_features: usize, out_features: usize, lr: f32, seed: u64) -> Self {
        let mut base = MachineBase::new(seed);
        let w = Param::kaiming(in_features, out_features, base.rng());
        Self {
            base,
            w,
            b: Param::zeros(&[out_features]),
            loss: MseLoss::new(Reduction::Mean),
            optim: Sgd::new(lr),
        }
    }

    fn output_grad(&self, x: &IO, t: &IO, state: &State) -> Result<ArrayD<f32>> {
        let y = state.require_io(self.id(), Some(x.id()), FIELD_Y)?;
        let mut dy = self.loss.grad_y(&y, &t.detached(), None)?;
        Ok(dy.remove(0))
    }
}

impl LearningMachine for LinearLearner {
    fn id(&self) -> MachineId {
        self.base.id()
    }

    fn forward(&mut self, x: &IO, state: &mut State, release: bool) -> Result<IO> {
        x.freshen();
        let y = IO::from_array(project(x, &self.w, &self.b)?);
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
        state.require_phase(self.id(), Some(x.id()), Phase::Forwarded, "step", "forward")?;
        let dy = self.output_grad(x, t, state)?;
        let x_sum = summed_input(x)?;
        let (dw, db, _) = linear_grads(&x_sum, &self.w, &dy)?;

        self.w.g += &dw;
        self.b.g += &db;
        self.optim.step(&mut [&mut self.w, &mut self.b])?;
        self.optim.zero_grad(&mut [&mut self.w, &mut self.b])?;
        state.set_phase(self.id(), Some(x.id()), Phase::Stepped);
        Ok(())
    }

    fn step_x(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<IO> {
        state.require_phase(self.id(), Some(x.id()), Phase::Forwarded, "step_x", "forward")?;
        let dy = self.output_grad(x, t, state)?;
        let x_sum = summed_input(x)?;
        let (_, _, dx) = linear_grads(&x_sum, &self.w, &dy)?;
        Ok(IO::from_array(x.f()?.to_array() - dx))
    }
}

impl Parameterized for LinearLearner {
    fn parameters(&self) -> Vec<&Param> {
        vec![&self.w, &self.b]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w, &mut self.b]
    }
}

/// Accumulating linear machine.
///
/// Multi-value inputs are summed before projection, so the same machine
/// serves single-input nodes and fan-in merge outputs; `step_x` corrects
/// every input value from its accumulated gradient.
pub struct AccLinearLearner {
    base: MachineBase,
    w: Param,
    b: Param,
    loss: MseLoss,
    optim: Sgd,
}

impl AccLinearLearner {
    /// A dense accumulating learner over `in_features -> out_features`.
    pub fn new(in_features: usize, out_features: usize, lr: f32, seed: u64) -> Self {
        let mut base = MachineBase::new(seed);
        let w = Param::kaiming(in_features, out_features, base.rng());
        Self {
            base,
            w,
            b: Param::zeros(&[out_features]),
            loss: MseLoss::new(Reduction::Mean),
            optim: Sgd::new(lr),
        }
    }

    /// Persist the parameters.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        bincode::serialize_into(file, &(&self.w, &self.b))?;
        Ok(())
    }

    /// Restore parameters persisted with [`AccLinearLearner::save`].
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let (w, b): (Param, Param) = bincode::deserialize_from(file)?;
        if w.w.shape() != self.w.w.shape() || b.w.shape() != self.b.w.shape() {
            return Err(TelosError::InvalidParameter(
                "checkpoint shapes do not match this learner".into(),
            ));
        }
        self.w = w;
        self.b = b;
        Ok(())
    }
}

impl LearningMachine for AccLinearLearner {
    fn id(&self) -> MachineId {
        self.base.id()
    }

    fn forward(&mut self, x: &IO, state: &mut State, release: bool) -> Result<IO> {
        x.freshen();
        let y = IO::from_array(project(x, &self.w, &self.b)?);
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
        let mut corrected = Vec::with_capacity(x.len());
        for (i, v) in x.values().iter().enumerate() {
            let grad = v.grad().ok_or(TelosError::MissingGrad(i))?;
            corrected.push(v.to_array() - grad);
        }
        Ok(IO::from_arrays(corrected))
    }
}

impl AccLearningMachine for AccLinearLearner {
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
        let dy = dy.remove(0);

        let x_sum = summed_input(x)?;
        let (dw, db, dx) = linear_grads(&x_sum, &self.w, &dy)?;
        self.w.g += &dw;
        self.b.g += &db;
        // The summed input distributes the output gradient unchanged to
        // every value.
        for v in x.values() {
            v.add_grad(&dx);
        }
        state.set_phase(self.id(), Some(x.id()), Phase::Accumulated);
        Ok(())
    }
}

impl Parameterized for AccLinearLearner {
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
    fn test_forward_shapes_and_caching() {
        let mut learner = AccLinearLearner::new(3, 4, 0.1, 1);
        let mut state = State::new();
        let x = rand_io(2, 3, 1);

        let y = learner.forward(&x, &mut state, true).unwrap();
        assert_eq!(y.f().unwrap().shape(), vec![2, 4]);
        assert!(x.is_freshened());
        assert!(state.io(learner.id(), Some(x.id()), FIELD_Y).is_some());

        // The released output is a distinct instance from the cached one.
        let cached = state.io(learner.id(), Some(x.id()), FIELD_Y).unwrap();
        assert_ne!(cached.id(), y.id());
    }

    #[test]
    fn test_step_requires_accumulate() {
        let mut learner = AccLinearLearner::new(3, 3, 0.1, 2);
        let mut state = State::new();
        let x = rand_io(2, 3, 2);
        let t = rand_io(2, 3, 3);

        learner.forward(&x, &mut state, true).unwrap();
        assert!(matches!(
            learner.step(&x, &t, &mut state),
            Err(TelosError::PreconditionNotMet {
                op: "step",
                requires: "accumulate"
            })
        ));
        assert!(matches!(
            learner.step_x(&x, &t, &mut state),
            Err(TelosError::PreconditionNotMet { .. })
        ));
    }

    #[test]
    fn test_accumulate_requires_forward() {
        let mut learner = AccLinearLearner::new(3, 3, 0.1, 2);
        let mut state = State::new();
        let x = rand_io(2, 3, 2);
        let t = rand_io(2, 3, 3);

        assert!(matches!(
            learner.accumulate(&x, &t, &mut state),
            Err(TelosError::PreconditionNotMet {
                op: "accumulate",
                requires: "forward"
            })
        ));
    }

    #[test]
    fn test_accumulate_then_step_updates_parameters() {
        let mut learner = AccLinearLearner::new(3, 3, 0.1, 4);
        let mut state = State::new();
        let x = rand_io(2, 3, 5);
        let t = rand_io(2, 3, 6);

        learner.forward(&x, &mut state, true).unwrap();
        learner.accumulate(&x, &t, &mut state).unwrap();

        let before = parameter_vector(&learner);
        learner.step(&x, &t, &mut state).unwrap();
        let after = parameter_vector(&learner);
        assert!(before.iter().zip(after.iter()).any(|(a, b)| a != b));
    }

    #[test]
    fn test_step_x_corrects_input() {
        let mut learner = AccLinearLearner::new(3, 3, 0.1, 7);
        let mut state = State::new();
        let x = rand_io(2, 3, 8);
        let t = rand_io(2, 3, 9);

        learner.forward(&x, &mut state, true).unwrap();
        learner.accumulate(&x, &t, &mut state).unwrap();
        let x_prime = learner.step_x(&x, &t, &mut state).unwrap();

        assert_eq!(x_prime.f().unwrap().shape(), vec![2, 3]);
        assert_ne!(x_prime.f().unwrap().to_array(), x.f().unwrap().to_array());
    }

    #[test]
    fn test_plain_learner_step_and_step_x() {
        let mut learner = LinearLearner::new(3, 3, 0.1, 10);
        let mut state = State::new();
        let x = rand_io(2, 3, 11);
        let t = rand_io(2, 3, 12);

        // Fails loudly before forward.
        assert!(matches!(
            learner.step(&x, &t, &mut state),
            Err(TelosError::PreconditionNotMet {
                op: "step",
                requires: "forward"
            })
        ));

        learner.forward(&x, &mut state, true).unwrap();
        let before = parameter_vector(&learner);
        learner.step(&x, &t, &mut state).unwrap();
        assert!(parameter_vector(&learner)
            .iter()
            .zip(before.iter())
            .any(|(a, b)| a != b));

        let x_prime = learner.step_x(&x, &t, &mut state).unwrap();
        assert_ne!(x_prime.f().unwrap().to_array(), x.f().unwrap().to_array());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut learner = AccLinearLearner::new(3, 2, 0.1, 13);
        let path = std::env::temp_dir().join("telos_linear_ckpt_test.bin");
        learner.save(&path).unwrap();

        let before = parameter_vector(&learner);
        learner.w.w.fill(0.0);
        learner.b.w.fill(5.0);
        learner.load(&path).unwrap();
        assert_eq!(parameter_vector(&learner), before);

        let mut other = AccLinearLearner::new(4, 2, 0.1, 14);
        assert!(other.load(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
