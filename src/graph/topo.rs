//! Topological iteration over a [`Dag`](super::Dag), with an optional
//! two-phase BUSY/VISITED mode for parallel executors.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexSet;

use crate::error::{PlanError, Result};

use super::{Dag, VertexId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    NotVisited,
    Busy,
    Visited,
}

/// One step of topological iteration.
pub enum Step<'a, V> {
    /// A vertex whose predecessors have all been visited.
    Ready {
        uid: VertexId,
        data: &'a V,
        predecessors: &'a BTreeSet<VertexId>,
    },
    /// Busy mode only: no vertex is ready until some busy vertex leaves.
    Stalled,
    /// Iteration is exhausted.
    Done,
}

impl<V> Step<'_, V> {
    pub fn is_done(&self) -> bool {
        matches!(self, Step::Done)
    }
}

/// Iterator yielding vertices in topological order.
///
/// In plain mode a yielded vertex is immediately VISITED and its
/// successors move closer to readiness. In busy mode the vertex enters
/// the BUSY state instead and holds its successors back until
/// [`leave`](TopoIter::leave) promotes it to VISITED; this lets an
/// executor keep several vertices in flight at once.
///
/// Iteration never mutates the underlying graph.
pub struct TopoIter<'a, V, T> {
    dag: &'a Dag<V, T>,
    non_visited: IndexSet<VertexId>,
    states: HashMap<VertexId, VisitState>,
    pred_count: HashMap<VertexId, usize>,
    busy_mode: bool,
}

impl<'a, V, T> TopoIter<'a, V, T> {
    pub(super) fn new(dag: &'a Dag<V, T>, busy_mode: bool) -> Self {
        let non_visited: IndexSet<VertexId> = dag.ids().cloned().collect();
        let states = dag
            .ids()
            .map(|k| (k.clone(), VisitState::NotVisited))
            .collect();
        // Counting unvisited predecessors up front keeps the ready test a
        // plain integer comparison.
        let pred_count = dag
            .ids()
            .map(|k| (k.clone(), dag.get_predecessors(k).len()))
            .collect();
        Self {
            dag,
            non_visited,
            states,
            pred_count,
            busy_mode,
        }
    }

    /// Next vertex in topological order.
    ///
    /// In plain mode a stall before exhaustion means the graph has a
    /// cycle, which is reported with the shortest cycle found.
    pub fn next_element(&mut self) -> Result<Step<'a, V>> {
        if self.non_visited.is_empty() {
            return Ok(Step::Done);
        }

        let ready = self
            .non_visited
            .iter()
            .find(|k| self.pred_count.get(k.as_str()) == Some(&0))
            .cloned();

        let uid = match ready {
            Some(uid) => uid,
            None if self.busy_mode => return Ok(Step::Stalled),
            None => {
                for node in &self.non_visited {
                    if let Some(cycle) = self.dag.shortest_path(node, node) {
                        return Err(PlanError::with_origin(
                            format!("cycle detected: {}", cycle.join(" -> ")),
                            "dag.iter",
                        )
                        .uid(node.as_str()));
                    }
                }
                return Err(PlanError::with_origin(
                    "cycle detected (unknown error)",
                    "dag.iter",
                ));
            }
        };

        if self.busy_mode {
            self.states.insert(uid.clone(), VisitState::Busy);
        } else {
            self.states.insert(uid.clone(), VisitState::Visited);
            self.release_successors(&uid);
        }
        self.non_visited.shift_remove(&uid);

        match self.dag.get(&uid) {
            Some(data) => Ok(Step::Ready {
                predecessors: self.dag.get_predecessors(&uid),
                data,
                uid,
            }),
            None => Err(PlanError::with_origin(
                format!("vertex {} disappeared during iteration", uid),
                "dag.iter",
            )
            .uid(uid.as_str())),
        }
    }

    /// Promote a BUSY vertex to VISITED, unblocking its successors.
    pub fn leave(&mut self, uid: &str) -> Result<()> {
        if self.states.get(uid) != Some(&VisitState::Busy) {
            return Err(PlanError::with_origin(
                format!("vertex {} is not busy", uid),
                "dag.iter.leave",
            )
            .uid(uid));
        }
        self.states.insert(uid.to_string(), VisitState::Visited);
        self.release_successors(uid);
        Ok(())
    }

    fn release_successors(&mut self, uid: &str) {
        for succ in self.dag.get_successors(uid) {
            if let Some(count) = self.pred_count.get_mut(&succ) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_iteration_exhausts() {
        let mut dag: Dag<&'static str> = Dag::new();
        dag.add_vertex("x", "x", std::iter::empty()).unwrap();
        dag.add_vertex("y", "y", vec!["x".to_string()]).unwrap();

        let mut iter = dag.topo_iter();
        let mut order = vec![];
        loop {
            match iter.next_element().unwrap() {
                Step::Ready { uid, .. } => order.push(uid),
                Step::Done => break,
                Step::Stalled => panic!("plain mode stalled"),
            }
        }
        assert_eq!(order, vec!["x", "y"]);
    }

    #[test]
    fn test_leave_requires_busy() {
        let mut dag: Dag<i32> = Dag::new();
        dag.add_vertex("x", 1, std::iter::empty()).unwrap();
        let mut iter = dag.busy_iter();
        assert!(iter.leave("x").is_err());
        match iter.next_element().unwrap() {
            Step::Ready { uid, .. } => assert_eq!(uid, "x"),
            _ => panic!("x should be ready"),
        }
        assert!(iter.leave("x").is_ok());
        assert!(iter.leave("x").is_err());
        assert!(iter.next_element().unwrap().is_done());
    }

    #[test]
    fn test_busy_mode_gates_successors() {
        let mut dag: Dag<i32> = Dag::new();
        dag.add_vertex("x", 1, std::iter::empty()).unwrap();
        dag.add_vertex("y", 2, std::iter::empty()).unwrap();
        dag.add_vertex("z", 3, vec!["x".to_string(), "y".to_string()])
            .unwrap();

        let mut iter = dag.busy_iter();
        // both roots can be taken in flight simultaneously
        let a = match iter.next_element().unwrap() {
            Step::Ready { uid, .. } => uid,
            _ => panic!("expected ready"),
        };
        let b = match iter.next_element().unwrap() {
            Step::Ready { uid, .. } => uid,
            _ => panic!("expected ready"),
        };
        assert_ne!(a, b);

        // z is not ready until both workers are done
        assert!(matches!(iter.next_element().unwrap(), Step::Stalled));
        iter.leave(&a).unwrap();
        assert!(matches!(iter.next_element().unwrap(), Step::Stalled));
        iter.leave(&b).unwrap();
        match iter.next_element().unwrap() {
            Step::Ready { uid, .. } => assert_eq!(uid, "z"),
            _ => panic!("z should be ready"),
        }
    }
}
