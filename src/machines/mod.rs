//! Concrete learning machines.
//!
//! Reference machines exercising the framework contract: plain and
//! accumulating linear learners with local gradient rules, a feedback
//! alignment learner, and a deferred-step wrapper.

pub mod fa;
pub mod linear;
pub mod stack;

pub use fa::FaLinearLearner;
pub use linear::{AccLinearLearner, LinearLearner};
pub use stack::StackedStep;
