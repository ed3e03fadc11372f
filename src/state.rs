//! State - Explicit per-iteration learning context.
//!
//! `State` replaces any hidden global cache: the caller constructs one per
//! outer forward/step cycle and threads it by reference through every
//! machine call. Entries are keyed by a composite of owner machine, input
//! IO instance, and a field tag, so two machines (or two inputs) never
//! collide.
//!
//! The store is never cleared implicitly. Two sequential calls that reuse
//! the same input IO instance will read back cached entries from the first
//! call; creating a fresh `State` (and fresh input IOs) per logical step is
//! a caller responsibility, not something this type enforces.

use crate::container::ContainerCell;
use crate::error::{Result, TelosError};
use crate::io::{IoId, IO};
use crate::machine::{MachineId, Phase};
use std::collections::HashMap;

/// Field tag for a machine's lifecycle phase.
const PHASE: &str = "phase";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StateKey {
    machine: MachineId,
    io: Option<IoId>,
    field: &'static str,
}

/// A cached value. One variant per kind of thing machines stash between
/// the phases of a training step.
#[derive(Clone)]
pub enum Cached {
    /// A cached IO (typically a forward output).
    Io(IO),
    /// A stack of IOs (deferred-step accumulation).
    IoList(Vec<IO>),
    /// Lifecycle phase for a `(machine, input)` pair.
    Phase(Phase),
    /// A spawned container for a `(network, input)` pair.
    Container(ContainerCell),
}

/// Keyed store for one forward/backward cycle.
#[derive(Default)]
pub struct State {
    entries: HashMap<StateKey, Cached>,
}

impl State {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(machine: MachineId, io: Option<IoId>, field: &'static str) -> StateKey {
        StateKey { machine, io, field }
    }

    /// Whether an entry exists for this key.
    pub fn contains(&self, machine: MachineId, io: Option<IoId>, field: &'static str) -> bool {
        self.entries.contains_key(&Self::key(machine, io, field))
    }

    /// Cache an IO.
    pub fn set_io(&mut self, machine: MachineId, io: Option<IoId>, field: &'static str, value: IO) {
        self.entries
            .insert(Self::key(machine, io, field), Cached::Io(value));
    }

    /// Retrieve a cached IO.
    pub fn io(&self, machine: MachineId, io: Option<IoId>, field: &'static str) -> Option<IO> {
        match self.entries.get(&Self::key(machine, io, field)) {
            Some(Cached::Io(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Retrieve a cached IO or fail with a lookup error.
    pub fn require_io(
        &self,
        machine: MachineId,
        io: Option<IoId>,
        field: &'static str,
    ) -> Result<IO> {
        self.io(machine, io, field)
            .ok_or(TelosError::MissingState(field))
    }

    /// Append an IO to a stacked entry, creating the stack on first use.
    pub fn push_io(&mut self, machine: MachineId, io: Option<IoId>, field: &'static str, value: IO) {
        let entry = self
            .entries
            .entry(Self::key(machine, io, field))
            .or_insert_with(|| Cached::IoList(Vec::new()));
        if let Cached::IoList(stack) = entry {
            stack.push(value);
        } else {
            *entry = Cached::IoList(vec![value]);
        }
    }

    /// Remove and return a stacked entry.
    pub fn take_io_list(
        &mut self,
        machine: MachineId,
        io: Option<IoId>,
        field: &'static str,
    ) -> Option<Vec<IO>> {
        match self.entries.remove(&Self::key(machine, io, field)) {
            Some(Cached::IoList(stack)) => Some(stack),
            Some(other) => {
                // Wrong kind under this key: put it back untouched.
                self.entries.insert(Self::key(machine, io, field), other);
                None
            }
            None => None,
        }
    }

    /// Lifecycle phase for a `(machine, input)` pair.
    ///
    /// Pairs that were never seen are `Unforwarded`.
    pub fn phase(&self, machine: MachineId, io: Option<IoId>) -> Phase {
        match self.entries.get(&Self::key(machine, io, PHASE)) {
            Some(Cached::Phase(phase)) => *phase,
            _ => Phase::Unforwarded,
        }
    }

    /// Record a lifecycle transition.
    pub fn set_phase(&mut self, machine: MachineId, io: Option<IoId>, phase: Phase) {
        self.entries
            .insert(Self::key(machine, io, PHASE), Cached::Phase(phase));
    }

    /// Guard: fail unless the pair has reached `min`.
    ///
    /// This is the explicit form of the call-order dependency the framework
    /// enforces between `forward`, `accumulate`, `step` and `step_x`.
    pub fn require_phase(
        &self,
        machine: MachineId,
        io: Option<IoId>,
        min: Phase,
        op: &'static str,
        requires: &'static str,
    ) -> Result<()> {
        if self.phase(machine, io) < min {
            return Err(TelosError::PreconditionNotMet { op, requires });
        }
        Ok(())
    }

    /// Register a spawned container for a `(network, input)` pair.
    pub fn set_container(&mut self, machine: MachineId, io: Option<IoId>, container: ContainerCell) {
        self.entries
            .insert(Self::key(machine, io, "container"), Cached::Container(container));
    }

    /// Retrieve the container spawned for a `(network, input)` pair.
    pub fn container(&self, machine: MachineId, io: Option<IoId>) -> Option<ContainerCell> {
        match self.entries.get(&Self::key(machine, io, "container")) {
            Some(Cached::Container(container)) => Some(container.clone()),
            _ => None,
        }
    }

    /// Retrieve the container or fail with a lookup error.
    pub fn require_container(&self, machine: MachineId, io: Option<IoId>) -> Result<ContainerCell> {
        self.container(machine, io)
            .ok_or(TelosError::MissingState("container"))
    }
}
