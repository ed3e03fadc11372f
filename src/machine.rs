//! Learning machine traits - The polymorphic unit of computation.
//!
//! A learning machine exposes four operations over one training step:
//!
//! - `forward(x, state, release)` - compute the output, caching whatever
//!   later phases need into `state` keyed by `(self, x)`
//! - `assess_y(y, t)` - evaluate a loss, with no parameter side effects
//! - `step(x, t, state)` - apply one optimizer update to own parameters
//! - `step_x(x, t, state)` - compute the corrected input (`x_prime`) to hand
//!   to the producer of `x`
//!
//! The accumulating capability adds `accumulate(x, t, state)`, which computes
//! and caches gradients without applying them; its `step` and `step_x` are
//! guarded on accumulation having run.
//!
//! Lifecycle per `(machine, input)` pair:
//!
//! ```text
//! Unforwarded -> Forwarded -> Accumulated -> Stepped
//! ```
//!
//! Transitions are driven by callers (containers and networks), never
//! self-scheduled. A guarded operation invoked too early fails with a typed
//! precondition error naming the missing prerequisite; it is never replayed
//! implicitly.

use crate::assess::{Assessment, Reduction};
use crate::error::Result;
use crate::io::IO;
use crate::state::State;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU32, Ordering};

/// State field under which machines cache their forward output.
pub const FIELD_Y: &str = "y";

/// Unique identifier for a machine.
///
/// Issued from an atomic counter so state entries and containers can key by
/// machine identity across the whole program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineId(u32);

impl MachineId {
    fn fresh() -> Self {
        static NEXT_ID: AtomicU32 = AtomicU32::new(0);
        MachineId(NEXT_ID.fetch_add(1, Ordering::SeqCst))
    }
}

/// Lifecycle of one `(machine, input)` pair within a training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// No forward pass has run for this pair.
    Unforwarded,
    /// Forward output cached.
    Forwarded,
    /// Gradients computed and cached (accumulating machines).
    Accumulated,
    /// Parameter update applied.
    Stepped,
}

/// Common state shared by all machines: identity plus a seeded RNG.
#[derive(Debug, Clone)]
pub struct MachineBase {
    id: MachineId,
    rng: StdRng,
    seed: u64,
}

impl MachineBase {
    /// Create a base with a seed for reproducible randomness.
    ///
    /// Each base gets a unique machine id regardless of seed.
    pub fn new(seed: u64) -> Self {
        Self {
            id: MachineId::fresh(),
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    /// The unique machine id.
    #[inline]
    pub fn id(&self) -> MachineId {
        self.id
    }

    /// The RNG seed.
    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Mutable access to the seeded RNG.
    #[inline]
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// The base capability: forward computation, assessment, parameter update
/// and input correction.
pub trait LearningMachine {
    /// The machine's identity, used for state keys.
    fn id(&self) -> MachineId;

    /// Compute the output for `x`.
    ///
    /// Implementations cache anything later phases need (at minimum the
    /// output, under [`FIELD_Y`]) into `state` keyed by `(self, x)`, then
    /// return `y.out(release)` so the caller controls whether the output
    /// re-enters this machine's computation.
    fn forward(&mut self, x: &IO, state: &mut State, release: bool) -> Result<IO>;

    /// Evaluate the output against a target. No parameter side effects.
    fn assess_y(&self, y: &IO, t: &IO, reduction_override: Option<Reduction>)
        -> Result<Assessment>;

    /// Apply one optimizer update to this machine's parameters.
    fn step(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<()>;

    /// Compute the corrected input for `x` given target `t`.
    ///
    /// Must not assume `step` has run for this pair.
    fn step_x(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<IO>;

    /// Forward then assess in one call.
    fn assess(
        &mut self,
        x: &IO,
        t: &IO,
        reduction_override: Option<Reduction>,
        state: &mut State,
        release: bool,
    ) -> Result<Assessment> {
        let y = self.forward(x, state, release)?;
        self.assess_y(&y, t, reduction_override)
    }
}

/// The accumulating capability: gradient computation decoupled from the
/// optimizer update.
pub trait AccLearningMachine: LearningMachine {
    /// Compute gradients for `(x, t)` and cache them, advancing the pair to
    /// `Accumulated`. Does not touch parameters.
    fn accumulate(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_unique_ids() {
        let base1 = MachineBase::new(0);
        let base2 = MachineBase::new(0);
        assert_ne!(base1.id(), base2.id());
    }

    #[test]
    fn test_rng_deterministic() {
        let mut base1 = MachineBase::new(42);
        let mut base2 = MachineBase::new(42);
        let v1: u32 = base1.rng().gen();
        let v2: u32 = base2.rng().gen();
        assert_eq!(v1, v2);
        assert_eq!(base1.seed(), 42);
    }

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::Unforwarded < Phase::Forwarded);
        assert!(Phase::Forwarded < Phase::Accumulated);
        assert!(Phase::Accumulated < Phase::Stepped);
    }
}
