//! Network learners - Machines whose body is a composition of nodes.
//!
//! A network's forward pass wires sub-machines together through [`Node`]s,
//! each of which records a [`Connection`] into the container spawned for
//! this `(network, input)` call. Stepping then replays the container in
//! reverse: every node receives the target propagated to its output,
//! updates its parameters and computes the corrected input that becomes the
//! previous node's target.
//!
//! Per-node [`Node::step_priority`] chooses whether the parameter update or
//! the input correction runs first during the reverse pass; the update
//! sees pre- or post-update input gradients accordingly. That is a
//! configuration choice, not an ordering bug.
//!
//! Implementors provide the forward wiring and an assessment; the reverse
//! drivers are provided methods on [`NetworkLearner`] and
//! [`AccNetworkLearner`]. The [`NetMachine`]/[`AccNetMachine`] wrappers
//! adapt a network back into a machine so networks nest.

use crate::assess::{Assessment, Reduction};
use crate::container::{Connection, ContainerCell, Pipeline, TraversalStep};
use crate::error::{Result, TelosError};
use crate::graph::Graph;
use crate::io::IO;
use crate::machine::{AccLearningMachine, LearningMachine, MachineBase, MachineId, Phase};
use crate::state::State;
use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

/// The machine held by a node, split by capability.
///
/// Accumulation is optional: wrapping a basic machine makes `accumulate` a
/// no-op, so mixed networks can share one reverse driver.
pub enum MachineRef {
    /// A machine without the accumulating capability.
    Basic(Rc<RefCell<dyn LearningMachine>>),
    /// A machine that accumulates gradients before stepping.
    Accumulating(Rc<RefCell<dyn AccLearningMachine>>),
}

/// A sub-machine wrapped for use inside a network.
pub struct Node {
    machine: MachineRef,
    step_priority: bool,
}

impl Node {
    /// Wrap a basic machine.
    pub fn basic<M: LearningMachine + 'static>(machine: M, step_priority: bool) -> Rc<Node> {
        Self::basic_shared(Rc::new(RefCell::new(machine)), step_priority)
    }

    /// Wrap an already-shared basic machine.
    pub fn basic_shared(
        machine: Rc<RefCell<dyn LearningMachine>>,
        step_priority: bool,
    ) -> Rc<Node> {
        Rc::new(Node {
            machine: MachineRef::Basic(machine),
            step_priority,
        })
    }

    /// Wrap an accumulating machine.
    pub fn accumulating<M: AccLearningMachine + 'static>(
        machine: M,
        step_priority: bool,
    ) -> Rc<Node> {
        Self::accumulating_shared(Rc::new(RefCell::new(machine)), step_priority)
    }

    /// Wrap an already-shared accumulating machine.
    pub fn accumulating_shared(
        machine: Rc<RefCell<dyn AccLearningMachine>>,
        step_priority: bool,
    ) -> Rc<Node> {
        Rc::new(Node {
            machine: MachineRef::Accumulating(machine),
            step_priority,
        })
    }

    /// Whether `step` runs before `step_x` for this node.
    #[inline]
    pub fn step_priority(&self) -> bool {
        self.step_priority
    }

    /// Whether the wrapped machine has the accumulating capability.
    pub fn accumulates(&self) -> bool {
        matches!(self.machine, MachineRef::Accumulating(_))
    }

    /// The wrapped machine's id.
    pub fn machine_id(&self) -> MachineId {
        match &self.machine {
            MachineRef::Basic(machine) => machine.borrow().id(),
            MachineRef::Accumulating(machine) => machine.borrow().id(),
        }
    }

    /// Run the wrapped machine's forward pass and, when a container is
    /// given, record the invocation into it.
    pub fn forward(
        node: &Rc<Node>,
        x: &IO,
        state: &mut State,
        release: bool,
        container: Option<&ContainerCell>,
    ) -> Result<IO> {
        let y = match &node.machine {
            MachineRef::Basic(machine) => machine.borrow_mut().forward(x, state, release)?,
            MachineRef::Accumulating(machine) => {
                machine.borrow_mut().forward(x, state, release)?
            }
        };
        if let Some(container) = container {
            container
                .borrow_mut()
                .add(Connection::new(x.clone(), y.clone(), Rc::clone(node)))?;
        }
        Ok(y)
    }

    /// Delegate assessment to the wrapped machine.
    pub fn assess_y(
        &self,
        y: &IO,
        t: &IO,
        reduction_override: Option<Reduction>,
    ) -> Result<Assessment> {
        match &self.machine {
            MachineRef::Basic(machine) => machine.borrow().assess_y(y, t, reduction_override),
            MachineRef::Accumulating(machine) => {
                machine.borrow().assess_y(y, t, reduction_override)
            }
        }
    }

    /// Delegate the parameter update to the wrapped machine.
    pub fn step(&self, x: &IO, t: &IO, state: &mut State) -> Result<()> {
        match &self.machine {
            MachineRef::Basic(machine) => machine.borrow_mut().step(x, t, state),
            MachineRef::Accumulating(machine) => machine.borrow_mut().step(x, t, state),
        }
    }

    /// Delegate the input correction to the wrapped machine.
    pub fn step_x(&self, x: &IO, t: &IO, state: &mut State) -> Result<IO> {
        match &self.machine {
            MachineRef::Basic(machine) => machine.borrow_mut().step_x(x, t, state),
            MachineRef::Accumulating(machine) => machine.borrow_mut().step_x(x, t, state),
        }
    }

    /// Delegate gradient accumulation; a no-op for basic machines.
    pub fn accumulate(&self, x: &IO, t: &IO, state: &mut State) -> Result<()> {
        match &self.machine {
            MachineRef::Basic(_) => Ok(()),
            MachineRef::Accumulating(machine) => machine.borrow_mut().accumulate(x, t, state),
        }
    }
}

/// Which container a network records into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Strictly linear recording.
    Pipeline,
    /// DAG recording with fan-in support.
    Graph,
}

/// Common state shared by all network learners: identity plus the container
/// prototype.
pub struct NetworkBase {
    base: MachineBase,
    kind: ContainerKind,
}

impl NetworkBase {
    /// Create a base recording into the given container kind.
    pub fn new(kind: ContainerKind) -> Self {
        Self {
            base: MachineBase::new(0),
            kind,
        }
    }

    /// The network's machine id.
    #[inline]
    pub fn id(&self) -> MachineId {
        self.base.id()
    }

    /// The container kind this network spawns.
    #[inline]
    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    /// Spawn a fresh container for this `(network, input)` call and register
    /// it in state.
    pub fn spawn_container(&self, x: &IO, state: &mut State) -> ContainerCell {
        let container: ContainerCell = match self.kind {
            ContainerKind::Pipeline => Pipeline::cell(),
            ContainerKind::Graph => Graph::cell(),
        };
        state.set_container(self.id(), Some(x.id()), container.clone());
        container
    }

    /// The container spawned for this `(network, input)` call.
    pub fn container(&self, x: &IO, state: &State) -> Result<ContainerCell> {
        state.require_container(self.id(), Some(x.id()))
    }
}

/// Drive one reverse step/step_x visit for a yielded connection.
///
/// Accumulating nodes have their gradients computed here first, so a plain
/// step pass can drive them without violating their ordering guard.
fn visit_step(step: &TraversalStep, state: &mut State) -> Result<IO> {
    let target = step.t.clone().ok_or(TelosError::UnresolvedTarget)?;
    if step.node.accumulates() {
        step.node.accumulate(&step.x, &target, state)?;
    }
    if step.node.step_priority() {
        step.node.step(&step.x, &target, state)?;
        step.node.step_x(&step.x, &target, state)
    } else {
        let x_prime = step.node.step_x(&step.x, &target, state)?;
        step.node.step(&step.x, &target, state)?;
        Ok(x_prime)
    }
}

/// A machine whose body is a recorded composition of nodes.
///
/// Implementors provide the wiring and assessment; `forward`, `step` and
/// `step_x` are provided.
pub trait NetworkLearner {
    /// Shared network state.
    fn base(&self) -> &NetworkBase;

    /// The forward wiring: run each node with the given container so the
    /// invocations are recorded.
    fn wire(
        &mut self,
        x: &IO,
        state: &mut State,
        release: bool,
        container: &ContainerCell,
    ) -> Result<IO>;

    /// Evaluate the network output against a target.
    fn assess_y(&self, y: &IO, t: &IO, reduction_override: Option<Reduction>)
        -> Result<Assessment>;

    /// Spawn a container, record the forward wiring into it.
    fn forward(&mut self, x: &IO, state: &mut State, release: bool) -> Result<IO> {
        let container = self.base().spawn_container(x, state);
        let y = self.wire(x, state, release, &container)?;
        state.set_phase(self.base().id(), Some(x.id()), Phase::Forwarded);
        Ok(y)
    }

    /// Reverse pass: per node, step/step_x in the node's configured order,
    /// committing each corrected input back into the container. Returns the
    /// last corrected input (the one for the network's own input).
    fn step(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<IO> {
        let container = self.base().container(x, state)?;
        container.borrow_mut().set_out_target(t);
        container.borrow_mut().start_reverse()?;
        debug!("network: reverse step pass");

        let mut x_prime = None;
        loop {
            let step = container.borrow_mut().next_reverse()?;
            let Some(step) = step else { break };
            let prime = visit_step(&step, state)?;
            container.borrow_mut().set_x_prime(&step.y, prime.clone())?;
            x_prime = Some(prime);
        }
        state.set_phase(self.base().id(), Some(x.id()), Phase::Stepped);
        x_prime.ok_or_else(|| TelosError::Other("network recorded no connections".into()))
    }

    /// Corrected network input; requires `step` to have run for this pair.
    fn step_x(&mut self, x: &IO, _t: &IO, state: &mut State) -> Result<IO> {
        state.require_phase(self.base().id(), Some(x.id()), Phase::Stepped, "step_x", "step")?;
        let container = self.base().container(x, state)?;
        let first = container.borrow().first()?;
        let target = first.t.clone().ok_or(TelosError::UnresolvedTarget)?;
        first.node.step_x(&first.x, &target, state)
    }
}

/// A network learner that separates gradient accumulation from the
/// parameter update.
pub trait AccNetworkLearner {
    /// Shared network state.
    fn base(&self) -> &NetworkBase;

    /// The forward wiring; see [`NetworkLearner::wire`].
    fn wire(
        &mut self,
        x: &IO,
        state: &mut State,
        release: bool,
        container: &ContainerCell,
    ) -> Result<IO>;

    /// Evaluate the network output against a target.
    fn assess_y(&self, y: &IO, t: &IO, reduction_override: Option<Reduction>)
        -> Result<Assessment>;

    /// Spawn a container, record the forward wiring into it.
    fn forward(&mut self, x: &IO, state: &mut State, release: bool) -> Result<IO> {
        let container = self.base().spawn_container(x, state);
        let y = self.wire(x, state, release, &container)?;
        state.set_phase(self.base().id(), Some(x.id()), Phase::Forwarded);
        Ok(y)
    }

    /// Reverse pass computing gradients and corrected inputs for every node
    /// without touching parameters.
    fn accumulate(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<()> {
        let container = self.base().container(x, state)?;
        container.borrow_mut().set_out_target(t);
        container.borrow_mut().start_reverse()?;
        debug!("network: reverse accumulate pass");

        loop {
            let step = container.borrow_mut().next_reverse()?;
            let Some(step) = step else { break };
            let target = step.t.clone().ok_or(TelosError::UnresolvedTarget)?;
            step.node.accumulate(&step.x, &target, state)?;
            let x_prime = step.node.step_x(&step.x, &target, state)?;
            container.borrow_mut().set_x_prime(&step.y, x_prime)?;
        }
        state.set_phase(self.base().id(), Some(x.id()), Phase::Accumulated);
        Ok(())
    }

    /// Apply every node's parameter update; requires `accumulate`.
    fn step(&mut self, x: &IO, _t: &IO, state: &mut State) -> Result<()> {
        state.require_phase(
            self.base().id(),
            Some(x.id()),
            Phase::Accumulated,
            "step",
            "accumulate",
        )?;
        let container = self.base().container(x, state)?;
        container.borrow_mut().start_reverse()?;
        debug!("network: reverse parameter-update pass");

        loop {
            let step = container.borrow_mut().next_reverse()?;
            let Some(step) = step else { break };
            let target = step.t.clone().ok_or(TelosError::UnresolvedTarget)?;
            step.node.step(&step.x, &target, state)?;
        }
        Ok(())
    }

    /// Corrected network input; requires `accumulate`.
    fn step_x(&mut self, x: &IO, _t: &IO, state: &mut State) -> Result<IO> {
        state.require_phase(
            self.base().id(),
            Some(x.id()),
            Phase::Accumulated,
            "step_x",
            "accumulate",
        )?;
        let container = self.base().container(x, state)?;
        let first = container.borrow().first()?;
        let target = first.t.clone().ok_or(TelosError::UnresolvedTarget)?;
        first.node.step_x(&first.x, &target, state)
    }
}

/// Adapter: use a [`NetworkLearner`] as a [`LearningMachine`].
pub struct NetMachine<N: NetworkLearner>(pub N);

impl<N: NetworkLearner> LearningMachine for NetMachine<N> {
    fn id(&self) -> MachineId {
        self.0.base().id()
    }

    fn forward(&mut self, x: &IO, state: &mut State, release: bool) -> Result<IO> {
        NetworkLearner::forward(&mut self.0, x, state, release)
    }

    fn assess_y(
        &self,
        y: &IO,
        t: &IO,
        reduction_override: Option<Reduction>,
    ) -> Result<Assessment> {
        NetworkLearner::assess_y(&self.0, y, t, reduction_override)
    }

    fn step(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<()> {
        NetworkLearner::step(&mut self.0, x, t, state).map(|_| ())
    }

    fn step_x(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<IO> {
        NetworkLearner::step_x(&mut self.0, x, t, state)
    }
}

/// Adapter: use an [`AccNetworkLearner`] as an [`AccLearningMachine`].
pub struct AccNetMachine<N: AccNetworkLearner>(pub N);

impl<N: AccNetworkLearner> LearningMachine for AccNetMachine<N> {
    fn id(&self) -> MachineId {
        self.0.base().id()
    }

    fn forward(&mut self, x: &IO, state: &mut State, release: bool) -> Result<IO> {
        AccNetworkLearner::forward(&mut self.0, x, state, release)
    }

    fn assess_y(
        &self,
        y: &IO,
        t: &IO,
        reduction_override: Option<Reduction>,
    ) -> Result<Assessment> {
        AccNetworkLearner::assess_y(&self.0, y, t, reduction_override)
    }

    fn step(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<()> {
        AccNetworkLearner::step(&mut self.0, x, t, state)
    }

    fn step_x(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<IO> {
        AccNetworkLearner::step_x(&mut self.0, x, t, state)
    }
}

impl<N: AccNetworkLearner> AccLearningMachine for AccNetMachine<N> {
    fn accumulate(&mut self, x: &IO, t: &IO, state: &mut State) -> Result<()> {
        AccNetworkLearner::accumulate(&mut self.0, x, t, state)
    }
}
