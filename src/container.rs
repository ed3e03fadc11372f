//! Containers - Recorded machine invocations and reverse target propagation.
//!
//! During a forward pass each node appends a [`Connection`]: the
//! `(input, output, node)` triple plus mutable slots for the eventually
//! resolved target `t` and the eventually computed predecessor target
//! `x_prime`. Walking the recorded structure in reverse then drives the
//! step/step_x pass: the target for a machine's output is the corrected
//! input computed by whatever consumed that output.
//!
//! The reverse traversal is an explicit two-method cursor protocol instead
//! of a generator:
//!
//! 1. [`Container::start_reverse`] begins a single pass
//! 2. [`Container::next_reverse`] yields the next visitable connection,
//!    resolving its target lazily
//! 3. the caller computes `x_prime` for the yielded node and commits it via
//!    [`Container::set_x_prime`] *before* advancing; later connections'
//!    targets are only resolvable from committed values
//!
//! The pass is stateful and single-use: starting another pass while one is
//! in progress is an error; a new pass may begin once the previous one is
//! exhausted. Containers must not be iterated from two call sites at once.
//!
//! [`Pipeline`] is the strictly linear container; the DAG variant with
//! fan-in lives in [`crate::graph`].

use crate::error::{Result, TelosError};
use crate::io::{IoId, IO};
use crate::network::Node;
use log::{debug, trace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Shared handle to a type-erased container.
pub type ContainerCell = Rc<RefCell<dyn Container>>;

/// The producer recorded on a connection: a machine-bearing node, or the
/// symbolic marker for a fan-in merge.
#[derive(Clone)]
pub enum NodeRef {
    /// An ordinary machine node.
    Machine(Rc<Node>),
    /// A synthetic merge connection created by `cat`.
    Merge,
}

/// One recorded machine invocation.
pub struct Connection {
    x: IO,
    y: IO,
    node: NodeRef,
    multi: bool,
    /// Original input IOs, populated for merge connections.
    xs: Vec<IO>,
    t: Option<IO>,
    x_prime: Option<IO>,
}

impl Connection {
    /// Record that `node` produced `y` from `x`.
    pub fn new(x: IO, y: IO, node: Rc<Node>) -> Self {
        Self {
            x,
            y,
            node: NodeRef::Machine(node),
            multi: false,
            xs: Vec::new(),
            t: None,
            x_prime: None,
        }
    }

    /// Record a fan-in merge of `xs` into `y`.
    pub fn merge(xs: Vec<IO>, y: IO) -> Self {
        let x = IO::join(&xs);
        Self {
            x,
            y,
            node: NodeRef::Merge,
            multi: true,
            xs,
            t: None,
            x_prime: None,
        }
    }

    /// The input IO.
    pub fn x(&self) -> &IO {
        &self.x
    }

    /// The output IO.
    pub fn y(&self) -> &IO {
        &self.y
    }

    /// The recorded producer.
    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    /// Whether this is a fan-in merge.
    pub fn is_merge(&self) -> bool {
        self.multi
    }

    /// The target resolved for `y`, once a reverse pass has visited here.
    pub fn t(&self) -> Option<&IO> {
        self.t.as_ref()
    }

    /// The corrected input, once the consumer of this connection committed it.
    pub fn x_prime(&self) -> Option<&IO> {
        self.x_prime.as_ref()
    }

    pub(crate) fn set_t(&mut self, t: Option<IO>) {
        self.t = t;
    }

    pub(crate) fn set_x_prime(&mut self, x_prime: IO) {
        self.x_prime = Some(x_prime);
    }

    /// This connection's `x_prime` contribution for the producer of `input`.
    ///
    /// For an ordinary connection that is the whole `x_prime`; for a merge
    /// it is the value range `input` originally contributed.
    pub(crate) fn x_prime_for(&self, input: &IO) -> Option<IO> {
        let x_prime = self.x_prime.as_ref()?;
        if !self.multi {
            return Some(x_prime.clone());
        }
        let mut start = 0usize;
        for x_j in &self.xs {
            let width = x_j.len();
            if x_j.id() == input.id() {
                return x_prime.range(Some(start), Some(start + width), false).ok();
            }
            start += width;
        }
        None
    }

    /// Ids of the original inputs of a merge connection, in order.
    pub(crate) fn merge_input_ids(&self) -> Vec<IoId> {
        self.xs.iter().map(IO::id).collect()
    }

    /// The values a reverse pass hands to the caller. `None` for merges,
    /// which are handled inside the container.
    pub(crate) fn step(&self) -> Option<TraversalStep> {
        match &self.node {
            NodeRef::Machine(node) => Some(TraversalStep {
                x: self.x.clone(),
                y: self.y.clone(),
                node: Rc::clone(node),
                t: self.t.clone(),
            }),
            NodeRef::Merge => None,
        }
    }
}

/// One visit yielded by a reverse pass: `(x, y, node, t)`.
#[derive(Clone)]
pub struct TraversalStep {
    /// The input recorded at forward time.
    pub x: IO,
    /// The output recorded at forward time.
    pub y: IO,
    /// The node to update.
    pub node: Rc<Node>,
    /// The resolved target for `y`, if resolvable yet.
    pub t: Option<IO>,
}

/// Where an overridden target comes from.
#[derive(Debug, Clone, Copy)]
pub enum TargetSource {
    /// The container's overall target.
    Out,
    /// The `x_prime` eventually computed for another recorded output.
    Io(IoId),
}

/// A recorded collection of connections supporting reverse target
/// propagation.
pub trait Container {
    /// Record a connection.
    fn add(&mut self, connection: Connection) -> Result<()>;

    /// Record a fan-in merge of `xs`, returning the merged IO.
    fn cat(&mut self, xs: &[IO]) -> Result<IO>;

    /// Designate `y` as the terminal output.
    fn set_out(&mut self, y: &IO) -> Result<()>;

    /// Set the overall target.
    fn set_out_target(&mut self, t: &IO);

    /// Resolve the target for a recorded output.
    ///
    /// `Ok(None)` means the target is not resolvable yet (its source has not
    /// been committed); an unrecorded `y` is an error.
    fn get_target(&self, y: &IO) -> Result<Option<IO>>;

    /// Register explicit target overrides.
    fn set_t(&mut self, pairs: &[(IO, TargetSource)]) -> Result<()>;

    /// Remove target overrides.
    fn detach_t(&mut self, keys: &[IO]);

    /// Commit the corrected input computed for the producer of `y`.
    fn set_x_prime(&mut self, y: &IO, x_prime: IO) -> Result<()>;

    /// Whether `y` was recorded as an output here.
    fn contains_y(&self, y: &IO) -> bool;

    /// The first recorded connection.
    fn first(&self) -> Result<TraversalStep>;

    /// Begin a reverse pass. Fails if a pass is already in progress.
    fn start_reverse(&mut self) -> Result<()>;

    /// Yield the next connection of the active pass, or `None` when done.
    fn next_reverse(&mut self) -> Result<Option<TraversalStep>>;

    /// Number of recorded connections.
    fn len(&self) -> usize;

    /// Whether nothing has been recorded.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strictly linear container: every connection's input must be the previous
/// connection's output, by instance.
#[derive(Default)]
pub struct Pipeline {
    steps: Vec<Connection>,
    index: HashMap<IoId, usize>,
    out: Option<IoId>,
    out_set: bool,
    t: Option<IO>,
    overrides: HashMap<IoId, TargetSource>,
    cursor: Option<usize>,
    in_pass: bool,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared-handle constructor for use as a container prototype.
    pub fn cell() -> ContainerCell {
        Rc::new(RefCell::new(Self::new()))
    }

    fn position(&self, y: &IO) -> Result<usize> {
        self.index
            .get(&y.id())
            .copied()
            .ok_or(TelosError::UnknownOutput)
    }

    fn end_position(&self) -> Option<usize> {
        if self.steps.is_empty() {
            return None;
        }
        if self.out_set {
            self.out.and_then(|id| self.index.get(&id).copied())
        } else {
            Some(self.steps.len() - 1)
        }
    }
}

impl Container for Pipeline {
    fn add(&mut self, connection: Connection) -> Result<()> {
        if let Some(last) = self.steps.last() {
            if connection.x().id() != last.y().id() {
                return Err(TelosError::OutOfSequence);
            }
        }
        trace!(
            "pipeline: recording connection {} of chain",
            self.steps.len()
        );
        self.index.insert(connection.y().id(), self.steps.len());
        if !self.out_set {
            self.out = Some(connection.y().id());
        }
        self.steps.push(connection);
        Ok(())
    }

    fn cat(&mut self, _xs: &[IO]) -> Result<IO> {
        Err(TelosError::Unsupported(
            "fan-in merges require a graph container",
        ))
    }

    fn set_out(&mut self, y: &IO) -> Result<()> {
        self.position(y)?;
        self.out = Some(y.id());
        self.out_set = true;
        Ok(())
    }

    fn set_out_target(&mut self, t: &IO) {
        self.t = Some(t.clone());
    }

    fn get_target(&self, y: &IO) -> Result<Option<IO>> {
        if let Some(source) = self.overrides.get(&y.id()) {
            return match source {
                TargetSource::Out => Ok(self.t.clone()),
                TargetSource::Io(id) => {
                    let position = self
                        .index
                        .get(id)
                        .copied()
                        .ok_or(TelosError::UnknownOutput)?;
                    Ok(self.steps[position].x_prime().cloned())
                }
            };
        }
        let position = self.position(y)?;
        if Some(y.id()) == self.out {
            return Ok(self.t.clone());
        }
        // The target for a layer's output is the corrected input computed by
        // the next layer, once committed.
        match self.steps.get(position + 1) {
            Some(next) => Ok(next.x_prime().cloned()),
            None => Ok(None),
        }
    }

    fn set_t(&mut self, pairs: &[(IO, TargetSource)]) -> Result<()> {
        for (x, source) in pairs {
            let own = self.position(x)?;
            if let TargetSource::Io(id) = source {
                let target = self
                    .index
                    .get(id)
                    .copied()
                    .ok_or(TelosError::UnknownOutput)?;
                if target <= own {
                    return Err(TelosError::NonCausalTarget);
                }
            }
            self.overrides.insert(x.id(), *source);
        }
        Ok(())
    }

    fn detach_t(&mut self, keys: &[IO]) {
        for key in keys {
            self.overrides.remove(&key.id());
        }
    }

    fn set_x_prime(&mut self, y: &IO, x_prime: IO) -> Result<()> {
        let position = self.position(y)?;
        self.steps[position].set_x_prime(x_prime);
        Ok(())
    }

    fn contains_y(&self, y: &IO) -> bool {
        self.index.contains_key(&y.id())
    }

    fn first(&self) -> Result<TraversalStep> {
        self.steps
            .first()
            .and_then(Connection::step)
            .ok_or(TelosError::UnknownOutput)
    }

    fn start_reverse(&mut self) -> Result<()> {
        if self.in_pass {
            return Err(TelosError::TraversalInProgress);
        }
        self.cursor = self.end_position();
        self.in_pass = self.cursor.is_some();
        debug!(
            "pipeline: starting reverse pass over {} connections",
            self.cursor.map_or(0, |c| c + 1)
        );
        Ok(())
    }

    fn next_reverse(&mut self) -> Result<Option<TraversalStep>> {
        let Some(position) = self.cursor else {
            self.in_pass = false;
            return Ok(None);
        };
        let t = self.get_target(&self.steps[position].y().clone())?;
        self.steps[position].set_t(t);
        let step = self.steps[position]
            .step()
            .ok_or(TelosError::Unsupported("merge connection in a pipeline"))?;
        if position == 0 {
            self.cursor = None;
            self.in_pass = false;
        } else {
            self.cursor = Some(position - 1);
        }
        Ok(Some(step))
    }

    fn len(&self) -> usize {
        self.steps.len()
    }
}
