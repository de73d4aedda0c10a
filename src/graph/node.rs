// SPDX-License-Identifier: MIT OR Apache-2.0

//! Node model for the intervention graph.
//!
//! A [`Node`] is one unit of deferred computation: an operation, an
//! ordered argument list, and a result slot populated when the node
//! fires during host execution. Nodes reference each other by name
//! through the owning [`Graph`](crate::Graph), never by direct
//! ownership, so the node table stays an arena with index-style lookups.

use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;
use indexmap::IndexSet;

use crate::error::{Result, WeaveError};
use crate::mirror::TensorSpec;
use crate::path::ObservationPoint;

// ---------------------------------------------------------------------------
// NodeRef
// ---------------------------------------------------------------------------

/// Cheap handle to a node inside a [`Graph`](crate::Graph).
///
/// Returned by the graph builders and usable as an argument to further
/// builder calls; this is how expressions are recorded lazily without
/// real values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub(crate) name: Arc<str>,
}

impl NodeRef {
    pub(crate) fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    /// The node's stable name, unique within its graph.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ---------------------------------------------------------------------------
// Arg
// ---------------------------------------------------------------------------

/// One argument of a node: a reference to another node's result, or an
/// inline literal.
#[derive(Debug, Clone)]
pub enum Arg {
    /// The result of another node in the same graph.
    Node(NodeRef),
    /// A literal tensor, available immediately.
    Literal(Tensor),
}

impl Arg {
    /// Argument referencing another node.
    #[must_use]
    pub fn node(node: &NodeRef) -> Self {
        Self::Node(node.clone())
    }

    /// Literal tensor argument.
    #[must_use]
    pub const fn literal(tensor: Tensor) -> Self {
        Self::Literal(tensor)
    }
}

impl From<&NodeRef> for Arg {
    fn from(node: &NodeRef) -> Self {
        Self::node(node)
    }
}

impl From<Tensor> for Arg {
    fn from(tensor: Tensor) -> Self {
        Self::Literal(tensor)
    }
}

// ---------------------------------------------------------------------------
// TensorOp
// ---------------------------------------------------------------------------

/// Pure tensor function a node may apply to its resolved arguments.
///
/// This is the whole numerical vocabulary of the engine: the graph
/// intercepts and forwards values, it does not define tensor math beyond
/// these forwarding-adjacent combinators.
#[non_exhaustive]
#[derive(Clone)]
pub enum TensorOp {
    /// Broadcasting elementwise sum over all arguments.
    Add,
    /// Broadcasting elementwise difference (exactly two arguments).
    Sub,
    /// Broadcasting elementwise product over all arguments.
    Mul,
    /// Multiply a single argument by a scalar.
    Scale(f64),
    /// Arbitrary pure function of the resolved arguments.
    Custom(Arc<dyn Fn(&[Tensor]) -> Result<Tensor> + Send + Sync>),
}

impl TensorOp {
    /// Wrap a closure as a custom op.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[Tensor]) -> Result<Tensor> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Evaluate the op over resolved argument values.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::ShapeIncompatible`] on arity mismatch and
    /// [`WeaveError::Model`] on tensor-operation failure.
    pub fn apply(&self, args: &[Tensor]) -> Result<Tensor> {
        match self {
            Self::Add => fold_broadcast(args, "add", Tensor::broadcast_add),
            Self::Sub => {
                let [a, b] = two_args(args, "sub")?;
                Ok(a.broadcast_sub(b)?)
            }
            Self::Mul => fold_broadcast(args, "mul", Tensor::broadcast_mul),
            Self::Scale(factor) => {
                let [a] = one_arg(args, "scale")?;
                Ok((a * *factor)?)
            }
            Self::Custom(f) => f(args),
        }
    }

    /// Statically infer the result spec from argument specs, when the op's
    /// shape behavior is known.
    ///
    /// `None` entries (unknown specs) and [`TensorOp::Custom`] disable the
    /// check rather than failing it.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::ShapeIncompatible`] when fully-known argument
    /// specs cannot combine under this op.
    pub fn infer_spec(&self, args: &[Option<TensorSpec>]) -> Result<Option<TensorSpec>> {
        let combine_broadcast = |name: &str| -> Result<Option<TensorSpec>> {
            let mut acc: Option<TensorSpec> = None;
            for spec in args {
                let Some(spec) = spec else { return Ok(None) };
                acc = match acc {
                    None => Some(spec.clone()),
                    Some(prev) => Some(prev.broadcast_with(spec).ok_or_else(|| {
                        WeaveError::ShapeIncompatible(format!(
                            "`{name}` cannot broadcast {:?} with {:?}",
                            prev.dims, spec.dims
                        ))
                    })?),
                };
            }
            Ok(acc)
        };

        match self {
            Self::Add => combine_broadcast("add"),
            Self::Sub => combine_broadcast("sub"),
            Self::Mul => combine_broadcast("mul"),
            Self::Scale(_) => Ok(args.first().cloned().flatten()),
            Self::Custom(_) => Ok(None),
        }
    }
}

impl fmt::Debug for TensorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "Add"),
            Self::Sub => write!(f, "Sub"),
            Self::Mul => write!(f, "Mul"),
            Self::Scale(factor) => write!(f, "Scale({factor})"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Fold a broadcasting binary op over at least one argument.
fn fold_broadcast(
    args: &[Tensor],
    name: &str,
    op: fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
) -> Result<Tensor> {
    let (first, rest) = args.split_first().ok_or_else(|| {
        WeaveError::ShapeIncompatible(format!("`{name}` needs at least one argument"))
    })?;
    let mut acc = first.clone();
    for arg in rest {
        acc = op(&acc, arg)?;
    }
    Ok(acc)
}

fn two_args<'a>(args: &'a [Tensor], name: &str) -> Result<[&'a Tensor; 2]> {
    match args {
        [a, b] => Ok([a, b]),
        _ => Err(WeaveError::ShapeIncompatible(format!(
            "`{name}` takes exactly two arguments, got {}",
            args.len()
        ))),
    }
}

fn one_arg<'a>(args: &'a [Tensor], name: &str) -> Result<[&'a Tensor; 1]> {
    match args {
        [a] => Ok([a]),
        _ => Err(WeaveError::ShapeIncompatible(format!(
            "`{name}` takes exactly one argument, got {}",
            args.len()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Operation / Schedule
// ---------------------------------------------------------------------------

/// What produces a node's value.
#[derive(Debug, Clone)]
pub enum Operation {
    /// The host's value at an observation point.
    Observe(ObservationPoint),
    /// A literal tensor, available from graph construction.
    Literal(Tensor),
    /// A pure function of the node's arguments.
    Apply(TensorOp),
}

/// Which host iteration step(s) a node is eligible to fire at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    /// Fire at every iteration the node's observation occurs in.
    #[default]
    Every,
    /// Fire only at one specific iteration step.
    At(usize),
}

impl Schedule {
    /// Whether the schedule admits firing at `iteration`.
    #[must_use]
    pub fn matches(&self, iteration: usize) -> bool {
        match self {
            Self::Every => true,
            Self::At(step) => *step == iteration,
        }
    }

    /// Whether two schedules can ever admit the same iteration.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Every, _) | (_, Self::Every) => true,
            (Self::At(a), Self::At(b)) => a == b,
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One unit of deferred computation inside a [`Graph`](crate::Graph).
#[derive(Debug)]
pub struct Node {
    /// Stable name, unique within the graph.
    pub(crate) name: String,
    /// What produces this node's value.
    pub(crate) operation: Operation,
    /// Ordered arguments.
    pub(crate) args: Vec<Arg>,
    /// Names of nodes to notify when this node's value becomes available.
    /// Derived from `args` at registration time.
    pub(crate) dependents: IndexSet<String>,
    /// Result slot. Populated when the node fires, cleared only between
    /// executions.
    pub(crate) value: Option<Tensor>,
    /// Iteration the node last fired at, enforcing at most one firing per
    /// iteration.
    pub(crate) fired_at: Option<usize>,
    /// Eligible iteration step(s).
    pub(crate) schedule: Schedule,
    /// Statically inferred result spec, when the graph was built against
    /// a scanned mirror.
    pub(crate) spec: Option<TensorSpec>,
}

impl Node {
    pub(crate) fn new(name: String, operation: Operation, args: Vec<Arg>, schedule: Schedule) -> Self {
        // Literal nodes are available from the start of every execution.
        let value = match &operation {
            Operation::Literal(tensor) => Some(tensor.clone()),
            _ => None,
        };
        Self {
            name,
            operation,
            args,
            dependents: IndexSet::new(),
            value,
            fired_at: None,
            schedule,
            spec: None,
        }
    }

    /// The node's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node's current value, if it has fired this execution.
    #[must_use]
    pub const fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    /// Iteration step the node last fired at.
    #[must_use]
    pub const fn fired_at(&self) -> Option<usize> {
        self.fired_at
    }

    /// The node's firing schedule.
    #[must_use]
    pub const fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Names of nodes depending on this one.
    pub fn dependents(&self) -> impl Iterator<Item = &str> {
        self.dependents.iter().map(String::as_str)
    }

    /// Statically inferred result spec, when known.
    #[must_use]
    pub const fn spec(&self) -> Option<&TensorSpec> {
        self.spec.as_ref()
    }

    /// Reset per-execution state; literal nodes are reseeded.
    pub(crate) fn reset(&mut self) {
        self.value = match &self.operation {
            Operation::Literal(tensor) => Some(tensor.clone()),
            _ => None,
        };
        self.fired_at = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
