// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shape-only mirror of a host model.
//!
//! The mirror is a full structural copy of the host's module tree with all
//! tensors replaced by [`TensorSpec`] placeholders carrying only shape and
//! dtype metadata. It is built once when an
//! [`Interpreter`](crate::Interpreter) is constructed, populated by the
//! [`scan()`](crate::scan()) pass, mutated only by structural
//! [`Edit`](crate::Edit)s, and never executes real computation.
//!
//! Graphs built [`against`](crate::Graph::against) a mirror can reject
//! shape-incompatible construction before any real execution is attempted.

use candle_core::{DType, Tensor};
use indexmap::IndexMap;

use crate::error::{Result, WeaveError};
use crate::path::{Direction, ModuleNamespace, ModulePath, ObservationPoint};

// ---------------------------------------------------------------------------
// TensorSpec
// ---------------------------------------------------------------------------

/// Zero-cost tensor placeholder: dimensions and dtype, no data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    /// Tensor dimensions.
    pub dims: Vec<usize>,
    /// Element dtype.
    pub dtype: DType,
}

impl TensorSpec {
    /// Create a spec from explicit dimensions and dtype.
    pub fn new(dims: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self {
            dims: dims.into(),
            dtype,
        }
    }

    /// The spec of an existing tensor.
    #[must_use]
    pub fn of(tensor: &Tensor) -> Self {
        Self {
            dims: tensor.dims().to_vec(),
            dtype: tensor.dtype(),
        }
    }

    /// Whether a tensor matches this spec exactly.
    #[must_use]
    pub fn matches(&self, tensor: &Tensor) -> bool {
        tensor.dims() == self.dims.as_slice() && tensor.dtype() == self.dtype
    }

    /// Broadcast this spec with another, right-aligned: each dimension
    /// pair must be equal or contain a `1`.
    ///
    /// Returns `None` when the shapes cannot broadcast or the dtypes
    /// differ.
    #[must_use]
    pub fn broadcast_with(&self, other: &Self) -> Option<Self> {
        if self.dtype != other.dtype {
            return None;
        }
        let rank = self.dims.len().max(other.dims.len());
        let mut dims = vec![0usize; rank];
        for i in 0..rank {
            let a = dim_from_right(&self.dims, i);
            let b = dim_from_right(&other.dims, i);
            let merged = match (a, b) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => return None,
            };
            dims[rank - 1 - i] = merged;
        }
        Some(Self {
            dims,
            dtype: self.dtype,
        })
    }
}

/// Dimension `i` counting from the last axis, padding with 1.
fn dim_from_right(dims: &[usize], i: usize) -> usize {
    if i < dims.len() {
        dims[dims.len() - 1 - i]
    } else {
        1
    }
}

// ---------------------------------------------------------------------------
// MirrorModule
// ---------------------------------------------------------------------------

/// One module in the shape-only mirror tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MirrorModule {
    /// Child modules by name, in insertion order.
    children: IndexMap<String, MirrorModule>,
    /// Input spec recorded by the scan pass.
    input_spec: Option<TensorSpec>,
    /// Output spec recorded by the scan pass.
    output_spec: Option<TensorSpec>,
    /// Whether this module was inserted by an edit rather than reported
    /// by the host.
    passthrough: bool,
}

impl MirrorModule {
    /// Input spec recorded for this module, if the scan reached it.
    #[must_use]
    pub const fn input_spec(&self) -> Option<&TensorSpec> {
        self.input_spec.as_ref()
    }

    /// Output spec recorded for this module, if the scan reached it.
    #[must_use]
    pub const fn output_spec(&self) -> Option<&TensorSpec> {
        self.output_spec.as_ref()
    }

    /// Whether this module is an edit-inserted identity pass-through.
    #[must_use]
    pub const fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Child module names in insertion order.
    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    fn collect_paths(&self, prefix: &ModulePath, out: &mut Vec<ModulePath>) {
        for (name, child) in &self.children {
            let path = prefix.child(name);
            out.push(path.clone());
            child.collect_paths(&path, out);
        }
    }
}

// ---------------------------------------------------------------------------
// ShapeMirror
// ---------------------------------------------------------------------------

/// Structural copy of a host model carrying only shape/dtype metadata.
///
/// # Example
///
/// ```
/// use candle_weave::{ModulePath, ShapeMirror};
///
/// let mirror = ShapeMirror::from_paths(["layer0", "layer1", "layer1.mlp"]);
/// assert!(mirror.contains(&ModulePath::new("layer1.mlp")));
/// assert!(!mirror.contains(&ModulePath::new("layer2")));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShapeMirror {
    root: MirrorModule,
    /// Producer overrides installed by graph-patch edits: the named graph
    /// node, rather than the host module itself, is treated as producing
    /// the output at the keyed path.
    producers: IndexMap<ModulePath, String>,
}

impl ShapeMirror {
    /// Build a mirror from a host's module path list.
    ///
    /// Intermediate modules are created implicitly, so a flat list of leaf
    /// paths reproduces the full tree.
    pub fn from_paths<P>(paths: impl IntoIterator<Item = P>) -> Self
    where
        P: Into<ModulePath>,
    {
        let mut mirror = Self::default();
        for path in paths {
            mirror.ensure_path(&path.into());
        }
        mirror
    }

    fn ensure_path(&mut self, path: &ModulePath) -> &mut MirrorModule {
        let mut node = &mut self.root;
        for segment in path.segments() {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node
    }

    /// Look up the mirror module at `path`.
    #[must_use]
    pub fn lookup(&self, path: &ModulePath) -> Option<&MirrorModule> {
        let mut node = &self.root;
        for segment in path.segments() {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    fn lookup_mut(&mut self, path: &ModulePath) -> Option<&mut MirrorModule> {
        let mut node = &mut self.root;
        for segment in path.segments() {
            node = node.children.get_mut(segment)?;
        }
        Some(node)
    }

    /// Whether a module exists at `path`.
    #[must_use]
    pub fn contains(&self, path: &ModulePath) -> bool {
        self.lookup(path).is_some()
    }

    /// All module paths, depth-first in insertion order.
    #[must_use]
    pub fn paths(&self) -> Vec<ModulePath> {
        let mut out = Vec::new();
        self.root.collect_paths(&ModulePath::new(""), &mut out);
        out
    }

    /// Record a scanned spec at an observation point.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::Host`] when the point's path is not in the
    /// mirror; the scan must never report modules the host did not list.
    pub fn record(&mut self, point: &ObservationPoint, spec: TensorSpec) -> Result<()> {
        let module = self.lookup_mut(&point.path).ok_or_else(|| {
            WeaveError::Host(format!(
                "scan reported unknown module path `{}`",
                point.path
            ))
        })?;
        match point.direction {
            Direction::Input => module.input_spec = Some(spec),
            Direction::Output => module.output_spec = Some(spec),
        }
        Ok(())
    }

    /// The scanned spec at an observation point, if any.
    #[must_use]
    pub fn spec_at(&self, point: &ObservationPoint) -> Option<&TensorSpec> {
        let module = self.lookup(&point.path)?;
        match point.direction {
            Direction::Input => module.input_spec.as_ref(),
            Direction::Output => module.output_spec.as_ref(),
        }
    }

    /// Insert an identity pass-through module named `name` under `parent`,
    /// returning its path.
    ///
    /// The new module inherits the parent's output spec: an identity unit
    /// observes exactly the value its parent produced.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::Host`] if `parent` does not exist, or
    /// [`WeaveError::StructuralEditConflict`] if the child already exists.
    pub fn insert_passthrough(&mut self, parent: &ModulePath, name: &str) -> Result<ModulePath> {
        let parent_module = self
            .lookup_mut(parent)
            .ok_or_else(|| WeaveError::Host(format!("no module at `{parent}`")))?;
        if parent_module.children.contains_key(name) {
            return Err(WeaveError::StructuralEditConflict {
                path: parent.child(name),
            });
        }
        let spec = parent_module.output_spec.clone();
        parent_module.children.insert(
            name.to_string(),
            MirrorModule {
                children: IndexMap::new(),
                input_spec: spec.clone(),
                output_spec: spec,
                passthrough: true,
            },
        );
        Ok(parent.child(name))
    }

    /// Remove a pass-through module previously inserted at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::Host`] if no pass-through exists at `path`.
    pub fn remove_passthrough(&mut self, path: &ModulePath) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| WeaveError::Host(format!("cannot remove top-level `{path}`")))?;
        let parent_module = self
            .lookup_mut(&parent)
            .ok_or_else(|| WeaveError::Host(format!("no module at `{parent}`")))?;
        match parent_module.children.get(path.leaf()) {
            Some(child) if child.passthrough => {
                parent_module.children.shift_remove(path.leaf());
                Ok(())
            }
            Some(_) => Err(WeaveError::Host(format!(
                "module `{path}` was not inserted by an edit"
            ))),
            None => Err(WeaveError::Host(format!("no module at `{path}`"))),
        }
    }

    /// Install a producer override: treat the named graph node as the
    /// producer of the output at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::Host`] if `path` does not exist.
    pub fn set_producer(&mut self, path: &ModulePath, node_name: &str) -> Result<()> {
        if !self.contains(path) {
            return Err(WeaveError::Host(format!("no module at `{path}`")));
        }
        self.producers.insert(path.clone(), node_name.to_string());
        Ok(())
    }

    /// Remove a producer override at `path`.
    pub fn clear_producer(&mut self, path: &ModulePath) {
        self.producers.shift_remove(path);
    }

    /// The graph node registered as producer of the output at `path`.
    #[must_use]
    pub fn producer(&self, path: &ModulePath) -> Option<&str> {
        self.producers.get(path).map(String::as_str)
    }
}

impl ModuleNamespace for ShapeMirror {
    fn contains_path(&self, path: &ModulePath) -> bool {
        self.contains(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn spec_broadcast_rules() {
        let a = TensorSpec::new(vec![2, 3], DType::F32);
        let b = TensorSpec::new(vec![3], DType::F32);
        assert_eq!(
            a.broadcast_with(&b).unwrap(),
            TensorSpec::new(vec![2, 3], DType::F32)
        );

        let scalar = TensorSpec::new(Vec::new(), DType::F32);
        assert_eq!(a.broadcast_with(&scalar).unwrap(), a);

        let c = TensorSpec::new(vec![4], DType::F32);
        assert!(a.broadcast_with(&c).is_none());

        let wrong_dtype = TensorSpec::new(vec![2, 3], DType::F64);
        assert!(a.broadcast_with(&wrong_dtype).is_none());
    }

    #[test]
    fn spec_matches_tensor() {
        let t = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let spec = TensorSpec::of(&t);
        assert_eq!(spec.dims, vec![2, 3]);
        assert!(spec.matches(&t));

        let other = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(!spec.matches(&other));
    }

    #[test]
    fn mirror_tree_from_flat_paths() {
        let mirror = ShapeMirror::from_paths(["a.b.c", "a.d"]);
        assert!(mirror.contains(&ModulePath::new("a")));
        assert!(mirror.contains(&ModulePath::new("a.b")));
        assert!(mirror.contains(&ModulePath::new("a.b.c")));
        assert!(mirror.contains(&ModulePath::new("a.d")));
        assert!(!mirror.contains(&ModulePath::new("a.b.d")));

        let paths: Vec<String> = mirror.paths().iter().map(ToString::to_string).collect();
        assert_eq!(paths, vec!["a", "a.b", "a.b.c", "a.d"]);
    }

    #[test]
    fn record_and_lookup_specs() {
        let mut mirror = ShapeMirror::from_paths(["layer0"]);
        let point = ObservationPoint::output("layer0");
        mirror
            .record(&point, TensorSpec::new(vec![1, 8], DType::F32))
            .unwrap();
        assert_eq!(mirror.spec_at(&point).unwrap().dims, vec![1, 8]);
        assert!(mirror.spec_at(&ObservationPoint::input("layer0")).is_none());

        let unknown = ObservationPoint::output("layer9");
        assert!(mirror
            .record(&unknown, TensorSpec::new(vec![1], DType::F32))
            .is_err());
    }

    #[test]
    fn passthrough_insert_and_remove_restores_structure() {
        let mut mirror = ShapeMirror::from_paths(["layer0"]);
        mirror
            .record(
                &ObservationPoint::output("layer0"),
                TensorSpec::new(vec![4], DType::F32),
            )
            .unwrap();
        let original = mirror.clone();

        let path = mirror
            .insert_passthrough(&ModulePath::new("layer0"), "probe")
            .unwrap();
        assert_eq!(path.to_string(), "layer0.probe");
        let inserted = mirror.lookup(&path).unwrap();
        assert!(inserted.is_passthrough());
        // Identity unit carries its parent's output spec on both sides.
        assert_eq!(inserted.input_spec(), inserted.output_spec());
        assert_ne!(mirror, original);

        mirror.remove_passthrough(&path).unwrap();
        assert_eq!(mirror, original);
    }

    #[test]
    fn passthrough_insert_rejects_existing_child() {
        let mut mirror = ShapeMirror::from_paths(["a.b"]);
        let err = mirror
            .insert_passthrough(&ModulePath::new("a"), "b")
            .unwrap_err();
        assert!(matches!(err, WeaveError::StructuralEditConflict { .. }));
    }

    #[test]
    fn remove_rejects_host_modules() {
        let mut mirror = ShapeMirror::from_paths(["a.b"]);
        // `a.b` came from the host, not an edit.
        assert!(mirror.remove_passthrough(&ModulePath::new("a.b")).is_err());
    }
}
