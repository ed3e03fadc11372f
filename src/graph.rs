//! Graph - DAG container with fan-in merges.
//!
//! `Graph` relaxes [`crate::container::Pipeline`]'s chain invariant to a
//! DAG: an output may feed several downstream connections, and
//! [`Container::cat`] records a synthetic merge connection whose output
//! joins several inputs at the value level.
//!
//! Reverse traversal is an explicit reverse-topological scan over an arena
//! of connections referenced by index: a connection is visitable only once
//! every connection consuming its output has been visited, since its target
//! is the combination of those consumers' committed `x_prime` values. Merge
//! connections are resolved inside the scan, splitting their merged target
//! back into per-input value ranges, and are never yielded to the caller.
//! Among equally-ready connections the scan prefers the most recently
//! added, so a simple chain comes back output-first.

use crate::container::{Connection, Container, ContainerCell, TargetSource, TraversalStep};
use crate::error::{Result, TelosError};
use crate::io::{IoId, IO};
use log::{debug, trace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// DAG-structured container supporting fan-in.
#[derive(Default)]
pub struct Graph {
    conns: Vec<Connection>,
    by_y: HashMap<IoId, usize>,
    /// Input IO id -> indices of connections consuming it.
    consumers: HashMap<IoId, Vec<usize>>,
    out: Option<IoId>,
    out_set: bool,
    t: Option<IO>,
    /// Memoized resolved targets.
    resolved: RefCell<HashMap<IoId, IO>>,
    visited: Vec<bool>,
    remaining: usize,
    in_pass: bool,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared-handle constructor for use as a container prototype.
    pub fn cell() -> ContainerCell {
        Rc::new(RefCell::new(Self::new()))
    }

    fn register(&mut self, connection: Connection, inputs: Vec<IoId>) {
        // Any new structure invalidates previously resolved targets.
        self.resolved.borrow_mut().clear();
        let position = self.conns.len();
        for input in inputs {
            self.consumers.entry(input).or_default().push(position);
        }
        self.by_y.insert(connection.y().id(), position);
        if !self.out_set {
            self.out = Some(connection.y().id());
        }
        self.conns.push(connection);
    }

    /// Whether every consumer of connection `i`'s output has been visited.
    fn ready(&self, i: usize) -> bool {
        let y_id = self.conns[i].y().id();
        if Some(y_id) == self.out {
            return true;
        }
        match self.consumers.get(&y_id) {
            Some(list) => list.iter().all(|&j| self.visited[j]),
            None => true,
        }
    }

    /// Mark everything not upstream of the terminal output as visited, so it
    /// is never yielded and never blocks readiness.
    fn mask_unreachable(&mut self) {
        let Some(out) = self.out.and_then(|id| self.by_y.get(&id).copied()) else {
            return;
        };
        let mut reachable = vec![false; self.conns.len()];
        let mut stack = vec![out];
        while let Some(i) = stack.pop() {
            if reachable[i] {
                continue;
            }
            reachable[i] = true;
            let inputs: Vec<IoId> = if self.conns[i].is_merge() {
                self.conns[i].merge_input_ids()
            } else {
                vec![self.conns[i].x().id()]
            };
            for input in inputs {
                if let Some(&j) = self.by_y.get(&input) {
                    stack.push(j);
                }
            }
        }
        for (i, is_reachable) in reachable.iter().enumerate() {
            if !is_reachable {
                self.visited[i] = true;
                self.remaining -= 1;
            }
        }
    }
}

impl Container for Graph {
    fn add(&mut self, connection: Connection) -> Result<()> {
        trace!("graph: recording connection {}", self.conns.len());
        let input = connection.x().id();
        self.register(connection, vec![input]);
        Ok(())
    }

    fn cat(&mut self, xs: &[IO]) -> Result<IO> {
        let y = IO::join(xs);
        let inputs = xs.iter().map(IO::id).collect();
        trace!("graph: recording merge of {} inputs", xs.len());
        self.register(Connection::merge(xs.to_vec(), y.clone()), inputs);
        Ok(y)
    }

    fn set_out(&mut self, y: &IO) -> Result<()> {
        if !self.by_y.contains_key(&y.id()) {
            return Err(TelosError::UnknownOutput);
        }
        self.out = Some(y.id());
        self.out_set = true;
        Ok(())
    }

    fn set_out_target(&mut self, t: &IO) {
        self.t = Some(t.clone());
    }

    fn get_target(&self, y: &IO) -> Result<Option<IO>> {
        if let Some(t) = self.resolved.borrow().get(&y.id()) {
            return Ok(Some(t.clone()));
        }
        if !self.by_y.contains_key(&y.id()) {
            return Err(TelosError::UnknownOutput);
        }
        if Some(y.id()) == self.out {
            return Ok(self.t.clone());
        }

        let Some(list) = self.consumers.get(&y.id()) else {
            return Ok(None);
        };
        let mut contributions = Vec::with_capacity(list.len());
        for &j in list {
            match self.conns[j].x_prime_for(y) {
                Some(contribution) => contributions.push(contribution),
                // A consumer has not committed yet: not resolvable.
                None => return Ok(None),
            }
        }
        let target = match contributions.len() {
            0 => return Ok(None),
            1 => contributions.remove(0),
            _ => IO::sum(&contributions)?,
        };
        self.resolved.borrow_mut().insert(y.id(), target.clone());
        Ok(Some(target))
    }

    fn set_t(&mut self, _pairs: &[(IO, TargetSource)]) -> Result<()> {
        Err(TelosError::Unsupported(
            "target overrides are not supported for graphs",
        ))
    }

    fn detach_t(&mut self, _keys: &[IO]) {}

    fn set_x_prime(&mut self, y: &IO, x_prime: IO) -> Result<()> {
        let position = self
            .by_y
            .get(&y.id())
            .copied()
            .ok_or(TelosError::UnknownOutput)?;
        self.conns[position].set_x_prime(x_prime);
        Ok(())
    }

    fn contains_y(&self, y: &IO) -> bool {
        self.by_y.contains_key(&y.id())
    }

    fn first(&self) -> Result<TraversalStep> {
        self.conns
            .first()
            .and_then(Connection::step)
            .ok_or(TelosError::UnknownOutput)
    }

    fn start_reverse(&mut self) -> Result<()> {
        if self.in_pass {
            return Err(TelosError::TraversalInProgress);
        }
        self.visited = vec![false; self.conns.len()];
        self.remaining = self.conns.len();
        self.mask_unreachable();
        self.in_pass = self.remaining > 0;
        debug!(
            "graph: starting reverse pass over {} of {} connections",
            self.remaining,
            self.conns.len()
        );
        Ok(())
    }

    fn next_reverse(&mut self) -> Result<Option<TraversalStep>> {
        loop {
            if self.remaining == 0 {
                self.in_pass = false;
                return Ok(None);
            }
            // Latest-added first among ready connections.
            let Some(position) = (0..self.conns.len())
                .rev()
                .find(|&i| !self.visited[i] && self.ready(i))
            else {
                self.in_pass = false;
                return Err(TelosError::Other(
                    "graph contains a cycle; reverse traversal cannot make progress".into(),
                ));
            };

            let y = self.conns[position].y().clone();
            let t = self.get_target(&y)?;
            self.conns[position].set_t(t.clone());
            self.visited[position] = true;
            self.remaining -= 1;

            if self.conns[position].is_merge() {
                // A merge distributes the downstream target across its
                // inputs by value range; committing the merged target as its
                // x_prime is what makes the split available to producers.
                if let Some(t) = t {
                    self.conns[position].set_x_prime(t);
                }
                continue;
            }

            let step = self.conns[position]
                .step()
                .expect("non-merge connection yields a step");
            return Ok(Some(step));
        }
    }

    fn len(&self) -> usize {
        self.conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assess::{Assessment, MseLoss, Reduction};
    use crate::machine::{LearningMachine, MachineBase, MachineId};
    use crate::network::Node;
    use crate::state::State;
    use ndarray::ArrayD;

    struct NoopLearner {
        base: MachineBase,
    }

    impl NoopLearner {
        fn new() -> Self {
            Self {
                base: MachineBase::new(0),
            }
        }
    }

    impl LearningMachine for NoopLearner {
        fn id(&self) -> MachineId {
            self.base.id()
        }

        fn forward(&mut self, x: &IO, _state: &mut State, release: bool) -> Result<IO> {
            Ok(x.out(release))
        }

        fn assess_y(
            &self,
            y: &IO,
            t: &IO,
            reduction_override: Option<Reduction>,
        ) -> Result<Assessment> {
            MseLoss::new(Reduction::Mean).assess(y, t, reduction_override)
        }

        fn step(&mut self, _x: &IO, _t: &IO, _state: &mut State) -> Result<()> {
            Ok(())
        }

        fn step_x(&mut self, _x: &IO, t: &IO, _state: &mut State) -> Result<IO> {
            Ok(t.detached())
        }
    }

    fn node() -> Rc<Node> {
        Node::basic(NoopLearner::new(), false)
    }

    fn io() -> IO {
        IO::from_array(ArrayD::zeros(vec![2, 2]))
    }

    #[test]
    fn test_contains_y_after_add() {
        let mut graph = Graph::new();
        let (x, y) = (io(), io());
        graph.add(Connection::new(x, y.clone(), node())).unwrap();
        assert!(graph.contains_y(&y));
        assert!(!graph.contains_y(&io()));
    }

    #[test]
    fn test_reverse_yields_unset_target_as_none() {
        let mut graph = Graph::new();
        let (x, y) = (io(), io());
        graph.add(Connection::new(x, y.clone(), node())).unwrap();

        graph.start_reverse().unwrap();
        let step = graph.next_reverse().unwrap().unwrap();
        assert_eq!(step.y.id(), y.id());
        assert!(step.t.is_none());
    }

    #[test]
    fn test_reverse_returns_overall_target() {
        let mut graph = Graph::new();
        let (x, y, t) = (io(), io(), io());
        graph.add(Connection::new(x, y, node())).unwrap();
        graph.set_out_target(&t);

        graph.start_reverse().unwrap();
        let step = graph.next_reverse().unwrap().unwrap();
        assert_eq!(step.t.unwrap().id(), t.id());
    }

    #[test]
    fn test_reverse_visits_chain_output_first() {
        let mut graph = Graph::new();
        let (x, y, y2, t) = (io(), io(), io(), io());
        let (n1, n2) = (node(), node());
        graph.add(Connection::new(x, y.clone(), Rc::clone(&n1))).unwrap();
        graph.add(Connection::new(y, y2, Rc::clone(&n2))).unwrap();
        graph.set_out_target(&t);

        graph.start_reverse().unwrap();
        let first = graph.next_reverse().unwrap().unwrap();
        let second = graph.next_reverse().unwrap().unwrap();
        assert!(Rc::ptr_eq(&first.node, &n2));
        assert!(Rc::ptr_eq(&second.node, &n1));
        assert!(graph.next_reverse().unwrap().is_none());
    }

    #[test]
    fn test_cat_splits_target_by_value_ranges() {
        let mut graph = Graph::new();
        let x = io();
        let y = IO::from_array(ArrayD::from_elem(vec![2, 2], 1.0));
        let y2 = IO::from_array(ArrayD::from_elem(vec![2, 2], 2.0));
        let (n1, n2) = (node(), node());
        graph
            .add(Connection::new(x, y.clone(), Rc::clone(&n1)))
            .unwrap();
        graph
            .add(Connection::new(y.clone(), y2.clone(), Rc::clone(&n2)))
            .unwrap();

        // Fan-in of both intermediate outputs.
        let merged = graph.cat(&[y.clone(), y2.clone()]).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(graph.contains_y(&merged));

        let t = IO::from_arrays(vec![
            ArrayD::from_elem(vec![2, 2], 10.0),
            ArrayD::from_elem(vec![2, 2], 20.0),
        ]);
        graph.set_out_target(&t);

        graph.start_reverse().unwrap();
        // The merge resolves internally; y2's producer comes out first and
        // its target is the second value range of the merged target.
        let step = graph.next_reverse().unwrap().unwrap();
        assert!(Rc::ptr_eq(&step.node, &n2));
        let target = step.t.unwrap();
        assert_eq!(target.len(), 1);
        assert_eq!(
            target.f().unwrap().to_array(),
            ArrayD::from_elem(vec![2, 2], 20.0)
        );
    }

    #[test]
    fn test_fan_out_sums_contributions() {
        // One producer feeding two consumers: its target is the sum of both
        // committed corrections.
        let mut graph = Graph::new();
        let (x, y) = (io(), io());
        let y2 = io();
        let y3 = io();
        let (n1, n2, n3) = (node(), node(), node());
        graph.add(Connection::new(x, y.clone(), n1)).unwrap();
        graph
            .add(Connection::new(y.clone(), y2.clone(), n2))
            .unwrap();
        graph
            .add(Connection::new(y.clone(), y3.clone(), n3))
            .unwrap();
        let merged = graph.cat(&[y2.clone(), y3.clone()]).unwrap();
        assert!(graph.contains_y(&merged));
        let t = IO::from_arrays(vec![
            ArrayD::from_elem(vec![2, 2], 1.0),
            ArrayD::from_elem(vec![2, 2], 2.0),
        ]);
        graph.set_out_target(&t);

        graph.start_reverse().unwrap();
        let mut yielded = Vec::new();
        while let Some(step) = graph.next_reverse().unwrap() {
            graph
                .set_x_prime(&step.y, step.t.clone().unwrap_or_else(|| step.x.detached()))
                .unwrap();
            yielded.push(step);
        }

        // All three machine nodes visited; producers of y2/y3 before y's.
        assert_eq!(yielded.len(), 3);
        assert_eq!(yielded[2].y.id(), y.id());
        let target = yielded[2].t.clone().unwrap();
        assert_eq!(
            target.f().unwrap().to_array(),
            ArrayD::from_elem(vec![2, 2], 3.0)
        );
    }

    #[test]
    fn test_set_t_unsupported() {
        let mut graph = Graph::new();
        assert!(matches!(
            graph.set_t(&[]),
            Err(TelosError::Unsupported(_))
        ));
    }
}
