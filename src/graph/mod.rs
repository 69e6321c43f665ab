//! Directed acyclic graph keyed by vertex uid, with tagged vertices,
//! cycle detection and topological iteration.

pub mod topo;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;

use crate::error::{PlanError, Result};

pub type VertexId = String;

pub use topo::{Step, TopoIter};

static EMPTY_PREDECESSORS: BTreeSet<VertexId> = BTreeSet::new();

#[derive(Debug)]
struct Vertex<V> {
    data: V,
    predecessors: BTreeSet<VertexId>,
}

/// A DAG whose edges point predecessor to successor: a predecessor must
/// run before every vertex that lists it.
///
/// Only predecessors are stored; the successor index is derived lazily
/// and invalidated whenever any predecessor set changes. Mutations either
/// preserve acyclicity or are rejected (unless checks are explicitly
/// disabled by a caller that can guarantee the invariant).
#[derive(Debug)]
pub struct Dag<V, T = ()> {
    vertices: IndexMap<VertexId, Vertex<V>>,
    tags: HashMap<VertexId, T>,
    successors: RefCell<Option<HashMap<VertexId, BTreeSet<VertexId>>>>,
    has_cycle: Cell<Option<bool>>,
}

impl<V, T> Default for Dag<V, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, T> Dag<V, T> {
    pub fn new() -> Self {
        Self {
            vertices: IndexMap::new(),
            tags: HashMap::new(),
            successors: RefCell::new(None),
            has_cycle: Cell::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.vertices.contains_key(uid)
    }

    /// Data associated with a vertex.
    pub fn get(&self, uid: &str) -> Option<&V> {
        self.vertices.get(uid).map(|v| &v.data)
    }

    /// Vertex uids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &VertexId> {
        self.vertices.keys()
    }

    /// `(uid, data)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&VertexId, &V)> {
        self.vertices.iter().map(|(k, v)| (k, &v.data))
    }

    pub fn get_predecessors(&self, uid: &str) -> &BTreeSet<VertexId> {
        self.vertices
            .get(uid)
            .map(|v| &v.predecessors)
            .unwrap_or(&EMPTY_PREDECESSORS)
    }

    /// Successors of a vertex, from the lazily rebuilt successor index.
    pub fn get_successors(&self, uid: &str) -> BTreeSet<VertexId> {
        let mut cache = self.successors.borrow_mut();
        let index = cache.get_or_insert_with(|| {
            let mut index: HashMap<VertexId, BTreeSet<VertexId>> = self
                .vertices
                .keys()
                .map(|k| (k.clone(), BTreeSet::new()))
                .collect();
            for (uid, vertex) in &self.vertices {
                for pred in &vertex.predecessors {
                    index.entry(pred.clone()).or_default().insert(uid.clone());
                }
            }
            index
        });
        index.get(uid).cloned().unwrap_or_default()
    }

    fn invalidate(&mut self) {
        *self.successors.borrow_mut() = None;
        self.has_cycle.set(None);
    }

    /// Add a new vertex. Fails if the uid is already present.
    pub fn add_vertex<I>(&mut self, uid: &str, data: V, predecessors: I) -> Result<()>
    where
        I: IntoIterator<Item = VertexId>,
    {
        if self.vertices.contains_key(uid) {
            return Err(PlanError::with_origin(
                format!("vertex {} already exists", uid),
                "dag.add_vertex",
            )
            .uid(uid));
        }
        self.update_vertex(uid, Some(data), predecessors, true)
    }

    /// Add-or-extend a vertex.
    ///
    /// When the vertex already exists, `predecessors` are unioned with the
    /// existing ones and `data`, if given, replaces the previous payload.
    /// With `enable_checks` the predecessors must already exist and the
    /// mutation is rolled back if it would create a cycle; without, the
    /// caller is trusted to preserve acyclicity.
    pub fn update_vertex<I>(
        &mut self,
        uid: &str,
        data: Option<V>,
        predecessors: I,
        enable_checks: bool,
    ) -> Result<()>
    where
        I: IntoIterator<Item = VertexId>,
    {
        let predecessors: BTreeSet<VertexId> = predecessors.into_iter().collect();

        if enable_checks {
            // The graph must be valid before we touch it, otherwise the
            // rollback below cannot restore a sane state.
            self.check()?;

            let missing: Vec<&VertexId> = predecessors
                .iter()
                .filter(|k| !self.vertices.contains_key(k.as_str()))
                .collect();
            if !missing.is_empty() {
                return Err(PlanError::with_origin(
                    format!(
                        "predecessor on non existing vertices {}",
                        missing
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                    "dag.update_vertex",
                )
                .uid(uid));
            }
        }

        match self.vertices.get_mut(uid) {
            None => {
                let data = data.ok_or_else(|| {
                    PlanError::with_origin(
                        format!("new vertex {} has no data", uid),
                        "dag.update_vertex",
                    )
                    .uid(uid)
                })?;
                self.vertices.insert(
                    uid.to_string(),
                    Vertex {
                        data,
                        predecessors,
                    },
                );
                self.invalidate();
            }
            Some(vertex) => {
                let previous = vertex.predecessors.clone();
                vertex.predecessors.extend(predecessors);
                self.invalidate();

                if enable_checks && self.get_closure(uid).contains(uid) {
                    let cycle = self
                        .shortest_path(uid, uid)
                        .unwrap_or_else(|| vec![uid.to_string()]);
                    // Roll the edge extension back before reporting.
                    if let Some(vertex) = self.vertices.get_mut(uid) {
                        vertex.predecessors = previous;
                    }
                    self.invalidate();
                    return Err(PlanError::with_origin(
                        format!(
                            "cannot update vertex ({} creates a cycle: {})",
                            uid,
                            cycle.join(" -> ")
                        ),
                        "dag.update_vertex",
                    )
                    .uid(uid));
                }

                if let Some(data) = data {
                    if let Some(vertex) = self.vertices.get_mut(uid) {
                        vertex.data = data;
                    }
                }
            }
        }
        Ok(())
    }

    /// Attach an opaque tag to a vertex.
    pub fn add_tag(&mut self, uid: &str, tag: T) {
        self.tags.insert(uid.to_string(), tag);
    }

    pub fn get_tag(&self, uid: &str) -> Option<&T> {
        self.tags.get(uid)
    }

    /// All tags, keyed by vertex uid.
    pub fn tags(&self) -> impl Iterator<Item = (&VertexId, &T)> {
        self.tags.iter()
    }

    /// Transitive predecessors of a vertex (the vertex itself is included
    /// only when it lies on a cycle).
    pub fn get_closure(&self, uid: &str) -> BTreeSet<VertexId> {
        let mut visited: HashSet<VertexId> = HashSet::new();
        let mut closure = self.get_predecessors(uid).clone();
        loop {
            let frontier: Vec<VertexId> = closure
                .iter()
                .filter(|n| !visited.contains(n.as_str()))
                .cloned()
                .collect();
            if frontier.is_empty() {
                return closure;
            }
            for n in frontier {
                closure.extend(self.get_predecessors(&n).iter().cloned());
                visited.insert(n);
            }
        }
    }

    /// Shortest path from `source` to `target` following predecessor
    /// edges, or `None` if no path exists. When `source == target` a
    /// virtual source is substituted so the result is the shortest cycle
    /// through that vertex.
    pub fn shortest_path(&self, source: &str, target: &str) -> Option<Vec<VertexId>> {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        enum Node<'a> {
            Virtual,
            Id(&'a str),
        }

        let infinite = self.vertices.len() + 1;
        let mut dist: HashMap<Node, usize> = self
            .vertices
            .keys()
            .map(|k| (Node::Id(k.as_str()), infinite))
            .collect();
        let mut prev: HashMap<Node, Node> = HashMap::new();
        let mut unvisited: HashSet<Node> =
            self.vertices.keys().map(|k| Node::Id(k.as_str())).collect();

        if !unvisited.contains(&Node::Id(target)) {
            return None;
        }
        dist.insert(Node::Id(target), 0);

        let source_node = if source == target {
            dist.insert(Node::Virtual, infinite);
            unvisited.insert(Node::Virtual);
            Node::Virtual
        } else {
            Node::Id(source)
        };

        while !unvisited.is_empty() {
            let u = *unvisited
                .iter()
                .min_by_key(|n| dist.get(*n).copied().unwrap_or(infinite))?;
            unvisited.remove(&u);

            if u == source_node {
                break;
            }

            let preds = match u {
                Node::Virtual => &EMPTY_PREDECESSORS,
                Node::Id(id) => self.get_predecessors(id),
            };
            for p in preds {
                let mut v = Node::Id(p.as_str());
                // Cycle search: edges into the original source are
                // redirected to the virtual node.
                if source_node == Node::Virtual && p == target {
                    v = Node::Virtual;
                }
                let alt = dist.get(&u).copied().unwrap_or(infinite) + 1;
                if alt < dist.get(&v).copied().unwrap_or(infinite) {
                    dist.insert(v, alt);
                    prev.insert(v, u);
                }
            }
        }

        if dist.get(&source_node).copied().unwrap_or(infinite) >= infinite {
            return None;
        }

        let mut path = vec![source_node];
        while let Some(p) = prev.get(path.last()?) {
            path.push(*p);
        }
        Some(
            path.into_iter()
                .map(|n| match n {
                    Node::Virtual => target.to_string(),
                    Node::Id(id) => id.to_string(),
                })
                .collect(),
        )
    }

    /// Verify that all predecessors exist and that the graph is acyclic.
    /// The result is cached until the next mutation.
    pub fn check(&self) -> Result<()> {
        match self.has_cycle.get() {
            Some(false) => return Ok(()),
            Some(true) => {
                return Err(PlanError::with_origin(
                    "this DAG contains at least one cycle",
                    "dag.check",
                ));
            }
            None => {}
        }

        for (uid, vertex) in &self.vertices {
            if vertex
                .predecessors
                .iter()
                .any(|k| !self.vertices.contains_key(k.as_str()))
            {
                self.has_cycle.set(Some(true));
                return Err(PlanError::with_origin(
                    format!("invalid nodes in predecessors of {}", uid),
                    "dag.check",
                )
                .uid(uid.as_str()));
            }
        }

        let mut iter = TopoIter::new(self, false);
        loop {
            match iter.next_element() {
                Ok(Step::Done) => {
                    self.has_cycle.set(Some(false));
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    self.has_cycle.set(Some(true));
                    return Err(e);
                }
            }
        }
    }

    /// Vertex uids in topological order (predecessors first).
    pub fn topological_order(&self) -> Result<Vec<VertexId>> {
        let mut order = Vec::with_capacity(self.vertices.len());
        let mut iter = TopoIter::new(self, false);
        loop {
            match iter.next_element()? {
                Step::Done => return Ok(order),
                Step::Ready { uid, .. } => order.push(uid),
                Step::Stalled => unreachable!("plain iterator never stalls"),
            }
        }
    }

    /// Plain topological iterator.
    pub fn topo_iter(&self) -> TopoIter<'_, V, T> {
        TopoIter::new(self, false)
    }

    /// Busy-aware topological iterator for multi-worker executors: a
    /// yielded vertex stays BUSY and blocks its successors until
    /// `leave()` is called on it.
    pub fn busy_iter(&self) -> TopoIter<'_, V, T> {
        TopoIter::new(self, true)
    }

    /// GraphViz rendering of the graph, edges in execution order.
    pub fn as_dot(&self) -> String {
        let mut out = vec!["digraph G {".to_string(), "rankdir=\"LR\";".to_string()];
        for uid in self.vertices.keys() {
            out.push(format!("\"{}\"", uid));
        }
        for (uid, vertex) in &self.vertices {
            for pred in &vertex.predecessors {
                out.push(format!("\"{}\" -> \"{}\"", pred, uid));
            }
        }
        out.push("}".to_string());
        out.join("\n")
    }
}

impl<V: Clone, T: Clone> Dag<V, T> {
    /// New DAG with every edge flipped; tags are preserved.
    pub fn reverse_graph(&self, enable_checks: bool) -> Result<Self> {
        let mut result = Self::new();
        result.tags = self.tags.clone();

        for (uid, vertex) in &self.vertices {
            result.update_vertex(uid, Some(vertex.data.clone()), std::iter::empty(), false)?;
        }
        for (uid, vertex) in &self.vertices {
            for pred in &vertex.predecessors {
                result.update_vertex(pred, None, std::iter::once(uid.clone()), false)?;
            }
        }

        if enable_checks {
            match result.check() {
                Ok(()) => self.has_cycle.set(Some(false)),
                Err(e) => {
                    self.has_cycle.set(Some(true));
                    return Err(e);
                }
            }
        }
        Ok(result)
    }

    /// New DAG without the vertices matching `keep_out`; predecessors of a
    /// removed vertex are reattached to its successors so reachability
    /// between kept vertices is preserved.
    ///
    /// With `preserve_context`, removing a tagged vertex is an error since
    /// it would change what diagnostics can report.
    pub fn prune<F>(&self, keep_out: F, preserve_context: bool) -> Result<Self>
    where
        F: Fn(&Self, &str) -> bool,
    {
        let mut result = Self::new();
        let mut lifted: HashMap<VertexId, BTreeSet<VertexId>> = HashMap::new();

        for uid in self.topological_order()? {
            let mut predecessors: BTreeSet<VertexId> = BTreeSet::new();
            for pred in self.get_predecessors(&uid) {
                if let Some(set) = lifted.get(pred.as_str()) {
                    predecessors.extend(set.iter().cloned());
                }
            }

            if keep_out(self, &uid) {
                if preserve_context && self.tags.contains_key(&uid) {
                    return Err(PlanError::with_origin(
                        format!("cannot prune {}: vertex carries a tag", uid),
                        "dag.prune",
                    )
                    .uid(uid.as_str()));
                }
                lifted.insert(uid, predecessors);
            } else {
                let data = match self.get(&uid) {
                    Some(d) => d.clone(),
                    None => continue,
                };
                // Pruning cannot introduce a cycle, skip the checks.
                result.update_vertex(&uid, Some(data), predecessors, false)?;
                if let Some(tag) = self.tags.get(&uid) {
                    result.add_tag(&uid, tag.clone());
                }
                lifted.insert(uid.clone(), std::iter::once(uid).collect());
            }
        }
        Ok(result)
    }
}
