//! Telos - Learning machines with decoupled credit assignment.
//!
//! Telos is a Rust framework for composing trainable learning machines
//! whose parameter updates and input-target propagation are decoupled from
//! end-to-end backpropagation. It targets research into alternative
//! credit-assignment rules (target propagation, feedback alignment,
//! iterative and local updates) layered over a plain tensor substrate.
//!
//! # Architecture
//!
//! The framework is built around a few core components:
//!
//! - **IO / Idx**: identity-distinct value bundles passed between machines,
//!   with detachment and freshening semantics, plus partial-selection
//!   indices
//! - **State**: the explicit per-iteration context every call threads by
//!   reference; caches are keyed by `(machine, input)` identity
//! - **LearningMachine / AccLearningMachine**: the unit of computation
//!   (`forward`, `assess_y`, `step`, `step_x`, optionally `accumulate`)
//!   with a guarded lifecycle per `(machine, input)` pair
//! - **Pipeline / Graph**: containers recording the chain or DAG of machine
//!   invocations at forward time and replaying it in reverse to propagate
//!   targets in dependency order
//! - **Network learners**: machines whose body is a recorded composition of
//!   nodes, driving the reverse step/accumulate passes
//!
//! # Example
//!
//! ```
//! use telos::{
//!     AccLinearLearner, AccLearningMachine, LearningMachine, State, IO,
//! };
//! use ndarray::ArrayD;
//!
//! # fn main() -> telos::Result<()> {
//! let mut learner = AccLinearLearner::new(3, 3, 0.1, 42);
//!
//! // One training step: fresh state, forward, accumulate, step, step_x.
//! let mut state = State::new();
//! let x = IO::from_array(ArrayD::ones(vec![2, 3]));
//! let t = IO::from_array(ArrayD::zeros(vec![2, 3]));
//!
//! learner.forward(&x, &mut state, true)?;
//! learner.accumulate(&x, &t, &mut state)?;
//! learner.step(&x, &t, &mut state)?;
//! let x_prime = learner.step_x(&x, &t, &mut state)?;
//! assert_eq!(x_prime.f()?.shape(), vec![2, 3]);
//! # Ok(())
//! # }
//! ```
//!
//! # Execution model
//!
//! Everything is single-threaded and synchronous; the only sharing hazard
//! is staleness in [`State`], which callers avoid by constructing fresh
//! state (and input IOs) per logical step. Ordering violations (stepping
//! before accumulating, adding out-of-order connections, targeting earlier
//! pipeline positions) fail immediately with typed errors and are never
//! silently recomputed.

pub mod assess;
pub mod config;
pub mod container;
pub mod error;
pub mod graph;
pub mod io;
pub mod limit;
pub mod machine;
pub mod machines;
pub mod network;
pub mod optim;
pub mod state;
pub mod tensor;
pub mod utils;

pub use assess::{Assessment, MseLoss, Reduction};
pub use config::{LayerConfig, StackConfig};
pub use container::{
    Connection, Container, ContainerCell, NodeRef, Pipeline, TargetSource, TraversalStep,
};
pub use error::{Result, TelosError};
pub use graph::Graph;
pub use io::{idx_io, Idx, IoId, IO};
pub use limit::{FeatureLimit, RandomFeatureIdx};
pub use machine::{
    AccLearningMachine, LearningMachine, MachineBase, MachineId, Phase, FIELD_Y,
};
pub use machines::{AccLinearLearner, FaLinearLearner, LinearLearner, StackedStep};
pub use network::{
    AccNetMachine, AccNetworkLearner, ContainerKind, MachineRef, NetMachine, NetworkBase,
    NetworkLearner, Node,
};
pub use optim::{Optimizer, Param, Parameterized, Sgd};
pub use state::{Cached, State};
pub use tensor::Tensor;
pub use utils::{grad_vector, parameter_vector};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Framework name
pub const NAME: &str = "Telos";

/// Get version string
pub fn version() -> String {
    format!("{} v{}", NAME, VERSION)
}
