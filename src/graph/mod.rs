// SPDX-License-Identifier: MIT OR Apache-2.0

//! The intervention graph: deferred computation recorded against a host
//! model's observation points, resolved live as the host executes.
//!
//! A [`Graph`] owns its nodes in an arena keyed by name; inter-node
//! references go through the table, never through ownership cycles. The
//! `observation_index` maps each [`ObservationPoint`] to the nodes that
//! bind the value observed there, and [`Graph::resolve`] is the
//! interleaving protocol invoked re-entrantly from inside the host's own
//! call stack at each boundary.

mod node;

pub use node::{Arg, Node, NodeRef, Operation, Schedule, TensorOp};

use std::collections::{HashMap, VecDeque};

use candle_core::Tensor;
use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace};

use crate::error::{Result, WeaveError};
use crate::mirror::{ShapeMirror, TensorSpec};
use crate::path::{Direction, ModuleNamespace, ModulePath, ObservationPoint};

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Outcome of one [`Graph::resolve`] call.
#[derive(Debug)]
pub struct Resolution {
    /// The value the host should continue with: the original observation,
    /// or a write-back node's result.
    pub value: Tensor,
    /// Nodes that fired during this observation event, in firing order.
    /// Order among independent ready nodes is unspecified.
    pub fired: Vec<NodeRef>,
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// An owned collection of deferred-computation nodes plus the bookkeeping
/// that interleaves them with a host model's execution.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use candle_weave::{Arg, Graph, ObservationPoint, TensorOp};
///
/// let mut graph = Graph::new();
/// let a = graph.observe(ObservationPoint::output("layer0")).unwrap();
/// let one = Tensor::new(1.0f32, &Device::Cpu).unwrap();
/// let b = graph
///     .apply(TensorOp::Add, vec![Arg::node(&a), Arg::literal(one)])
///     .unwrap();
///
/// // Simulate the host producing 5.0 at layer0's output.
/// let observed = Tensor::new(5.0f32, &Device::Cpu).unwrap();
/// graph
///     .resolve(&ObservationPoint::output("layer0"), observed)
///     .unwrap();
/// let b_val = graph.require_value(&b).unwrap();
/// assert_eq!(b_val.to_scalar::<f32>().unwrap(), 6.0);
/// ```
#[derive(Debug, Default)]
pub struct Graph {
    /// Node arena, keyed by name, in insertion order.
    nodes: IndexMap<String, Node>,
    /// Observation point → nodes that bind the value observed there.
    observation_index: HashMap<ObservationPoint, Vec<String>>,
    /// Observation point → nodes registered to replace the value there.
    writebacks: HashMap<ObservationPoint, Vec<String>>,
    /// Write-backs already applied this execution, keyed by point and
    /// iteration. A second node hitting the same key is a hard error.
    applied_writebacks: HashMap<(ObservationPoint, usize), String>,
    /// Scanned specs snapshotted from the mirror, enabling static shape
    /// rejection in the builders. Empty for [`Graph::new`].
    specs: HashMap<ObservationPoint, TensorSpec>,
    /// Current iteration step. Advanced only by the increment hook,
    /// monotonic within one execution.
    iteration: usize,
    /// Counter for generated node names.
    next_id: usize,
}

impl Graph {
    /// Create an empty graph with no static shape knowledge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty graph that validates construction against a
    /// scanned [`ShapeMirror`].
    ///
    /// Builder calls on the returned graph reject nodes that are
    /// statically known to be shape-incompatible with the host.
    #[must_use]
    pub fn against(mirror: &ShapeMirror) -> Self {
        let mut specs = HashMap::new();
        for path in mirror.paths() {
            for direction in [Direction::Input, Direction::Output] {
                let point = ObservationPoint {
                    path: path.clone(),
                    direction,
                };
                if let Some(spec) = mirror.spec_at(&point) {
                    specs.insert(point, spec.clone());
                }
            }
        }
        Self {
            specs,
            ..Self::default()
        }
    }

    // --- Builders --------------------------------------------------------

    /// Add a node observing the host's value at `point`, eligible at
    /// every iteration.
    ///
    /// # Errors
    ///
    /// Never fails today; returns `Result` for parity with the other
    /// builders routed through [`Graph::add_node`].
    pub fn observe(&mut self, point: ObservationPoint) -> Result<NodeRef> {
        self.add_node(Operation::Observe(point), Vec::new(), Schedule::Every)
    }

    /// Add a node observing `point` only at iteration `step`.
    ///
    /// # Errors
    ///
    /// See [`Graph::observe`].
    pub fn observe_at(&mut self, point: ObservationPoint, step: usize) -> Result<NodeRef> {
        self.add_node(Operation::Observe(point), Vec::new(), Schedule::At(step))
    }

    /// Add a literal node whose value is available from the start of
    /// every execution.
    pub fn literal(&mut self, tensor: Tensor) -> NodeRef {
        let name = self.next_name();
        let mut node = Node::new(
            name.clone(),
            Operation::Literal(tensor.clone()),
            Vec::new(),
            Schedule::Every,
        );
        node.spec = Some(TensorSpec::of(&tensor));
        self.nodes.insert(name.clone(), node);
        NodeRef::new(&name)
    }

    /// Add a node applying a pure op to its arguments, eligible at every
    /// iteration.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::UnknownDependency`] when an argument
    /// references a node not in this graph, and
    /// [`WeaveError::ShapeIncompatible`] when scanned specs statically
    /// rule the op out.
    pub fn apply(&mut self, op: TensorOp, args: Vec<Arg>) -> Result<NodeRef> {
        self.add_node(Operation::Apply(op), args, Schedule::Every)
    }

    /// Add an op node eligible only at iteration `step`.
    ///
    /// # Errors
    ///
    /// See [`Graph::apply`].
    pub fn apply_at(&mut self, op: TensorOp, args: Vec<Arg>, step: usize) -> Result<NodeRef> {
        self.add_node(Operation::Apply(op), args, Schedule::At(step))
    }

    /// Add a node with an explicit operation, argument list, and schedule.
    ///
    /// Registers the new node as a dependent of every referenced node and
    /// indexes observe-nodes under their observation point.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::UnknownDependency`] for a missing argument
    /// node and [`WeaveError::ShapeIncompatible`] when static shape
    /// inference rules the node out.
    pub fn add_node(
        &mut self,
        operation: Operation,
        args: Vec<Arg>,
        schedule: Schedule,
    ) -> Result<NodeRef> {
        for arg in &args {
            if let Arg::Node(dep) = arg {
                if !self.nodes.contains_key(dep.name()) {
                    return Err(WeaveError::UnknownDependency {
                        name: dep.name().to_string(),
                    });
                }
            }
        }

        // Static shape inference: fails before the node is inserted.
        let spec = match &operation {
            Operation::Observe(point) => self.specs.get(point).cloned(),
            Operation::Literal(tensor) => Some(TensorSpec::of(tensor)),
            Operation::Apply(op) => {
                let arg_specs: Vec<Option<TensorSpec>> = args
                    .iter()
                    .map(|arg| match arg {
                        Arg::Literal(tensor) => Some(TensorSpec::of(tensor)),
                        Arg::Node(dep) => {
                            self.nodes.get(dep.name()).and_then(|n| n.spec.clone())
                        }
                    })
                    .collect();
                op.infer_spec(&arg_specs)?
            }
        };

        let name = self.next_name();
        let mut node = Node::new(name.clone(), operation, args, schedule);
        node.spec = spec;

        for arg in &node.args {
            if let Arg::Node(dep) = arg {
                if let Some(dep_node) = self.nodes.get_mut(dep.name()) {
                    dep_node.dependents.insert(name.clone());
                }
            }
        }
        if let Operation::Observe(point) = &node.operation {
            self.observation_index
                .entry(point.clone())
                .or_default()
                .push(name.clone());
        }
        self.nodes.insert(name.clone(), node);
        Ok(NodeRef::new(&name))
    }

    /// Register `node`'s value as the replacement for the value observed
    /// at `point` ("write-back").
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::UnknownDependency`] for a node not in this
    /// graph, and [`WeaveError::ConflictingWriteback`] when another
    /// registered write-back at the same point can fire at the same
    /// iteration.
    pub fn write_back(&mut self, point: ObservationPoint, node: &NodeRef) -> Result<()> {
        let schedule = self
            .nodes
            .get(node.name())
            .ok_or_else(|| WeaveError::UnknownDependency {
                name: node.name().to_string(),
            })?
            .schedule;

        let registered = self.writebacks.entry(point.clone()).or_default();
        for existing in registered.iter() {
            let other = self
                .nodes
                .get(existing)
                .map_or(Schedule::Every, |n| n.schedule);
            if schedule.overlaps(&other) {
                return Err(WeaveError::ConflictingWriteback {
                    point,
                    first: existing.clone(),
                    second: node.name().to_string(),
                });
            }
        }
        registered.push(node.name().to_string());
        Ok(())
    }

    // --- Compilation -----------------------------------------------------

    /// Bind the graph for execution against a host namespace.
    ///
    /// Walks every indexed observation point (observations and
    /// write-backs) and verifies its module path exists. Idempotent:
    /// compiling twice against the same structure is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::MissingObservationPoint`] naming the first
    /// path absent from the host.
    pub fn compile<N: ModuleNamespace + ?Sized>(&mut self, namespace: &N) -> Result<()> {
        for point in self
            .observation_index
            .keys()
            .chain(self.writebacks.keys())
        {
            if !namespace.contains_path(&point.path) {
                return Err(WeaveError::MissingObservationPoint {
                    path: point.path.clone(),
                });
            }
        }
        debug!(
            nodes = self.nodes.len(),
            points = self.observation_index.len(),
            "graph compiled"
        );
        Ok(())
    }

    // --- Interleaving protocol -------------------------------------------

    /// Resolve an observation event: bind eligible observe-nodes to the
    /// observed value, propagate through dependents, and apply at most
    /// one write-back.
    ///
    /// Points with neither observe-nodes nor write-backs take the fast
    /// path: the value is returned untouched, nothing fires, nothing is
    /// cloned.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::ConflictingWriteback`] when a second node
    /// attempts to replace the value at this point and iteration, and
    /// propagates tensor-operation failures from node evaluation.
    pub fn resolve(&mut self, point: &ObservationPoint, value: Tensor) -> Result<Resolution> {
        // A point may carry a write-back without any observe-node; only
        // points the graph references nowhere at all skip resolution.
        if !self.observation_index.contains_key(point) && !self.writebacks.contains_key(point) {
            return Ok(Resolution {
                value,
                fired: Vec::new(),
            });
        }
        let iteration = self.iteration;
        let candidates = self
            .observation_index
            .get(point)
            .cloned()
            .unwrap_or_default();

        let mut fired: Vec<String> = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        // Bind observe-nodes eligible at this iteration. A node that
        // already fired this iteration is skipped: repeated visits to a
        // shared module are distinct events, deduplicated here.
        for name in candidates {
            let Some(node) = self.nodes.get_mut(&name) else {
                continue;
            };
            if !node.schedule.matches(iteration) || node.fired_at == Some(iteration) {
                continue;
            }
            node.value = Some(value.clone());
            node.fired_at = Some(iteration);
            trace!(node = %name, %point, iteration, "observe node bound");
            queue.extend(node.dependents.iter().cloned());
            fired.push(name);
        }

        // Dataflow propagation: fire every dependent whose arguments are
        // all resolved, then enqueue its own dependents.
        while let Some(name) = queue.pop_front() {
            let evaluated = {
                let Some(node) = self.nodes.get(&name) else {
                    continue;
                };
                if node.fired_at == Some(iteration) || !node.schedule.matches(iteration) {
                    continue;
                }
                let Operation::Apply(op) = &node.operation else {
                    continue;
                };
                let mut args = Vec::with_capacity(node.args.len());
                let mut ready = true;
                for arg in &node.args {
                    match arg {
                        Arg::Literal(tensor) => args.push(tensor.clone()),
                        Arg::Node(dep) => {
                            match self.nodes.get(dep.name()).and_then(|d| d.value.as_ref()) {
                                Some(v) => args.push(v.clone()),
                                None => {
                                    ready = false;
                                    break;
                                }
                            }
                        }
                    }
                }
                if !ready {
                    // Still pending; a later observation may complete it.
                    continue;
                }
                (op.clone(), args)
            };
            let (op, args) = evaluated;
            let result = op.apply(&args)?;
            if let Some(node) = self.nodes.get_mut(&name) {
                node.value = Some(result);
                node.fired_at = Some(iteration);
                trace!(node = %name, iteration, "op node fired");
                queue.extend(node.dependents.iter().cloned());
            }
            fired.push(name);
        }

        // Write-back: at most one replacement per (point, iteration).
        let mut out = value;
        if let Some(registered) = self.writebacks.get(point) {
            let mut eligible: Vec<&String> = registered
                .iter()
                .filter(|name| {
                    self.nodes
                        .get(name.as_str())
                        .is_some_and(|n| n.fired_at == Some(iteration) && n.value.is_some())
                })
                .collect();
            if eligible.len() > 1 {
                return Err(WeaveError::ConflictingWriteback {
                    point: point.clone(),
                    first: eligible[0].clone(),
                    second: eligible[1].clone(),
                });
            }
            if let Some(name) = eligible.pop() {
                let key = (point.clone(), iteration);
                match self.applied_writebacks.get(&key) {
                    Some(prev) if prev != name => {
                        return Err(WeaveError::ConflictingWriteback {
                            point: point.clone(),
                            first: prev.clone(),
                            second: name.clone(),
                        });
                    }
                    _ => {
                        self.applied_writebacks.insert(key, name.clone());
                    }
                }
                if let Some(tensor) =
                    self.nodes.get(name.as_str()).and_then(|n| n.value.clone())
                {
                    trace!(node = %name, %point, iteration, "write-back applied");
                    out = tensor;
                }
            }
        }

        Ok(Resolution {
            value: out,
            fired: fired.iter().map(|name| NodeRef::new(name)).collect(),
        })
    }

    // --- Iteration -------------------------------------------------------

    /// Advance the iteration counter by one decoding step.
    ///
    /// Called exactly once per host loop iteration, by the increment
    /// hook, after sibling nodes at the increment point have resolved.
    pub fn increment(&mut self) {
        self.iteration += 1;
        debug!(iteration = self.iteration, "iteration advanced");
    }

    /// Current iteration step.
    #[must_use]
    pub const fn iteration(&self) -> usize {
        self.iteration
    }

    /// Clear per-execution state: node values, firing records, applied
    /// write-backs, and the iteration counter.
    ///
    /// Called at the start of each execution, never per iteration — a
    /// node may refire with a fresh value at each iteration of one run.
    pub fn reset(&mut self) {
        for node in self.nodes.values_mut() {
            node.reset();
        }
        self.applied_writebacks.clear();
        self.iteration = 0;
    }

    // --- Inspection ------------------------------------------------------

    /// A node's current value, if it has fired this execution.
    #[must_use]
    pub fn value(&self, node: &NodeRef) -> Option<&Tensor> {
        self.nodes.get(node.name()).and_then(|n| n.value.as_ref())
    }

    /// A node's value, or [`WeaveError::UnresolvedNode`] if it never
    /// fired.
    ///
    /// Non-completion is a normal outcome for nodes on host paths the
    /// execution did not take; this is the inspection point for callers
    /// that require completion.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::UnknownDependency`] for a foreign handle and
    /// [`WeaveError::UnresolvedNode`] for a node with no value.
    pub fn require_value(&self, node: &NodeRef) -> Result<&Tensor> {
        let found = self
            .nodes
            .get(node.name())
            .ok_or_else(|| WeaveError::UnknownDependency {
                name: node.name().to_string(),
            })?;
        found.value.as_ref().ok_or_else(|| WeaveError::UnresolvedNode {
            name: node.name().to_string(),
        })
    }

    /// Access a node by handle.
    #[must_use]
    pub fn node(&self, node: &NodeRef) -> Option<&Node> {
        self.nodes.get(node.name())
    }

    /// Handles of all nodes that never received a value this execution.
    #[must_use]
    pub fn unresolved(&self) -> Vec<NodeRef> {
        self.nodes
            .values()
            .filter(|n| n.value.is_none())
            .map(|n| NodeRef::new(&n.name))
            .collect()
    }

    /// Module paths the graph references, in first-reference order. This
    /// is the set the hook manager attaches to.
    #[must_use]
    pub fn observed_paths(&self) -> IndexSet<ModulePath> {
        self.nodes
            .values()
            .filter_map(|n| match &n.operation {
                Operation::Observe(point) => Some(point.path.clone()),
                _ => None,
            })
            .chain(self.writebacks.keys().map(|point| point.path.clone()))
            .collect()
    }

    /// Number of nodes in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn next_name(&mut self) -> String {
        let name = format!("node_{}", self.next_id);
        self.next_id += 1;
        name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
