//! Learner behavior tests: convergence, ordering guards across machine
//! kinds, deferred updates and checkpointing.

use approx::assert_relative_eq;
use ndarray::ArrayD;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::rc::Rc;
use telos::{
    AccLearningMachine, AccLinearLearner, FaLinearLearner, LearningMachine, LinearLearner,
    StackedStep, State, TelosError, IO,
};

fn rand_array(rows: usize, cols: usize, seed: u64) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::random_using(vec![rows, cols], Uniform::new(0.0, 1.0), &mut rng)
}

fn loss_of<M: LearningMachine>(machine: &mut M, x: &ArrayD<f32>, t: &ArrayD<f32>) -> f32 {
    let mut state = State::new();
    let x = IO::from_array(x.clone());
    let t = IO::from_array(t.clone());
    machine
        .assess(&x, &t, None, &mut state, true)
        .unwrap()
        .item()
        .unwrap()
}

#[test]
fn test_acc_learner_reduces_loss_over_iterations() {
    let mut learner = AccLinearLearner::new(3, 3, 0.1, 40);
    let x_data = rand_array(8, 3, 41);
    let t_data = rand_array(8, 3, 42);

    let initial = loss_of(&mut learner, &x_data, &t_data);
    for _ in 0..200 {
        // Fresh state and IOs each iteration, per the sharing discipline.
        let mut state = State::new();
        let x = IO::from_array(x_data.clone());
        let t = IO::from_array(t_data.clone());
        learner.forward(&x, &mut state, true).unwrap();
        learner.accumulate(&x, &t, &mut state).unwrap();
        learner.step(&x, &t, &mut state).unwrap();
    }
    let trained = loss_of(&mut learner, &x_data, &t_data);
    assert!(
        trained < initial * 0.5,
        "loss did not drop: {} -> {}",
        initial,
        trained
    );
}

#[test]
fn test_fa_learner_reduces_loss_over_iterations() {
    let mut learner = FaLinearLearner::new(3, 4, 0.05, 43);
    let x_data = rand_array(8, 3, 44);
    let t_data = rand_array(8, 4, 45);

    let initial = loss_of(&mut learner, &x_data, &t_data);
    for _ in 0..50 {
        let mut state = State::new();
        let x = IO::from_array(x_data.clone());
        let t = IO::from_array(t_data.clone());
        learner.forward(&x, &mut state, true).unwrap();
        learner.accumulate(&x, &t, &mut state).unwrap();
        learner.step(&x, &t, &mut state).unwrap();
    }
    let trained = loss_of(&mut learner, &x_data, &t_data);
    assert!(
        trained < initial,
        "loss did not drop: {} -> {}",
        initial,
        trained
    );
}

#[test]
fn test_ordering_guards_name_prerequisites() {
    let mut learner = AccLinearLearner::new(3, 3, 0.1, 46);
    let mut state = State::new();
    let x = IO::from_array(rand_array(2, 3, 47));
    let t = IO::from_array(rand_array(2, 3, 48));

    // Nothing has run: every guarded operation reports what is missing.
    let err = learner.accumulate(&x, &t, &mut state).unwrap_err();
    assert_eq!(
        err.to_string(),
        "`accumulate` requires `forward` to have been called first"
    );

    learner.forward(&x, &mut state, true).unwrap();
    let err = learner.step(&x, &t, &mut state).unwrap_err();
    assert!(matches!(
        err,
        TelosError::PreconditionNotMet {
            op: "step",
            requires: "accumulate"
        }
    ));

    // A second input instance has its own lifecycle.
    let x2 = IO::from_array(rand_array(2, 3, 49));
    learner.forward(&x2, &mut state, true).unwrap();
    learner.accumulate(&x2, &t, &mut state).unwrap();
    learner.step(&x2, &t, &mut state).unwrap();
    assert!(matches!(
        learner.step(&x, &t, &mut state),
        Err(TelosError::PreconditionNotMet { .. })
    ));
}

#[test]
fn test_stacked_step_equals_one_concatenated_update() {
    // Two learners with identical init: one stepped over the concatenated
    // batch directly, one through the deferred stack.
    let direct = Rc::new(RefCell::new(LinearLearner::new(3, 3, 0.1, 50)));
    let deferred = Rc::new(RefCell::new(LinearLearner::new(3, 3, 0.1, 50)));

    let x1 = rand_array(2, 3, 51);
    let t1 = rand_array(2, 3, 52);
    let x2 = rand_array(4, 3, 53);
    let t2 = rand_array(4, 3, 54);

    // Direct: one forward/step over the concatenation.
    {
        let mut state = State::new();
        let x = IO::cat(&[IO::from_array(x1.clone()), IO::from_array(x2.clone())]).unwrap();
        let t = IO::cat(&[IO::from_array(t1.clone()), IO::from_array(t2.clone())]).unwrap();
        let mut machine = direct.borrow_mut();
        machine.forward(&x, &mut state, true).unwrap();
        machine.step(&x, &t, &mut state).unwrap();
    }

    // Deferred: record both pairs, flush once.
    {
        let mut state = State::new();
        let stacked = StackedStep::new(deferred.clone());
        stacked.step(
            &IO::from_array(x1.clone()),
            &IO::from_array(t1.clone()),
            &mut state,
        );
        stacked.step(
            &IO::from_array(x2.clone()),
            &IO::from_array(t2.clone()),
            &mut state,
        );
        stacked.flush(&mut state).unwrap();
    }

    let direct_params = telos::parameter_vector(&*direct.borrow());
    let deferred_params = telos::parameter_vector(&*deferred.borrow());
    for (a, b) in direct_params.iter().zip(deferred_params.iter()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-5);
    }
}

#[test]
fn test_checkpoint_transfers_behavior() -> anyhow::Result<()> {
    let mut trained = AccLinearLearner::new(3, 3, 0.05, 55);
    let x_data = rand_array(8, 3, 56);
    let t_data = rand_array(8, 3, 57);
    for _ in 0..20 {
        let mut state = State::new();
        let x = IO::from_array(x_data.clone());
        let t = IO::from_array(t_data.clone());
        trained.forward(&x, &mut state, true)?;
        trained.accumulate(&x, &t, &mut state)?;
        trained.step(&x, &t, &mut state)?;
    }

    let path = std::env::temp_dir().join("telos_machines_ckpt_test.bin");
    trained.save(&path)?;

    let mut restored = AccLinearLearner::new(3, 3, 0.05, 58);
    restored.load(&path)?;
    std::fs::remove_file(&path).ok();

    let a = loss_of(&mut trained, &x_data, &t_data);
    let b = loss_of(&mut restored, &x_data, &t_data);
    assert_relative_eq!(a, b, epsilon = 1e-6);
    Ok(())
}
