// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reversible structural edits to a host's module tree.
//!
//! An [`Edit`] is a forward/inverse pair over the module tree; an
//! [`Editor`] applies a recorded list in order and reverts it in reverse
//! order on every exit path, so the host always returns to its original
//! structural shape even though edits were needed during execution to
//! expose new observation points.

use tracing::debug;

use crate::error::{Result, WeaveError};
use crate::graph::NodeRef;
use crate::host::HostModel;
use crate::mirror::ShapeMirror;
use crate::path::ModulePath;

// ---------------------------------------------------------------------------
// Edit
// ---------------------------------------------------------------------------

/// One reversible structural patch.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Edit {
    /// Insert an identity pass-through submodule named `name` under
    /// `parent`, so the value flowing there becomes independently
    /// observable.
    InsertWrapper {
        /// Module receiving the new child.
        parent: ModulePath,
        /// Name of the inserted child.
        name: String,
    },
    /// Declare the named graph node as the producer of the output at
    /// `path` in the shape-only mirror. Structure-free on the live host;
    /// paired with an [`Edit::InsertWrapper`] that gives the produced
    /// value a concrete place to be observed.
    GraphPatch {
        /// Module whose mirrored production is rewired.
        path: ModulePath,
        /// Node treated as the producer.
        producer: NodeRef,
    },
}

impl Edit {
    /// Wrapper-insertion edit.
    pub fn insert_wrapper(parent: impl Into<ModulePath>, name: impl Into<String>) -> Self {
        Self::InsertWrapper {
            parent: parent.into(),
            name: name.into(),
        }
    }

    /// Producer-rewiring edit.
    pub fn graph_patch(path: impl Into<ModulePath>, producer: &NodeRef) -> Self {
        Self::GraphPatch {
            path: path.into(),
            producer: producer.clone(),
        }
    }

    /// The path this edit mutates; two edits sharing a target conflict.
    #[must_use]
    pub fn target(&self) -> ModulePath {
        match self {
            Self::InsertWrapper { parent, name } => parent.child(name),
            Self::GraphPatch { path, .. } => path.clone(),
        }
    }

    fn apply_host<H: HostModel>(&self, host: &mut H) -> Result<()> {
        match self {
            Self::InsertWrapper { parent, name } => host.insert_passthrough(parent, name),
            // Producer rewiring lives in the mirror; the live host's
            // structure is untouched.
            Self::GraphPatch { .. } => Ok(()),
        }
    }

    fn revert_host<H: HostModel>(&self, host: &mut H) -> Result<()> {
        match self {
            Self::InsertWrapper { .. } => host.remove_passthrough(&self.target()),
            Self::GraphPatch { .. } => Ok(()),
        }
    }

    pub(crate) fn apply_mirror(&self, mirror: &mut ShapeMirror) -> Result<()> {
        match self {
            Self::InsertWrapper { parent, name } => {
                mirror.insert_passthrough(parent, name).map(|_| ())
            }
            Self::GraphPatch { path, producer } => mirror.set_producer(path, producer.name()),
        }
    }

    pub(crate) fn revert_mirror(&self, mirror: &mut ShapeMirror) -> Result<()> {
        match self {
            Self::InsertWrapper { .. } => mirror.remove_passthrough(&self.target()),
            Self::GraphPatch { path, .. } => {
                mirror.clear_producer(path);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Editor
// ---------------------------------------------------------------------------

/// Scoped application of a list of [`Edit`]s.
///
/// Edits apply in recorded order and revert in reverse order. A partial
/// apply failure reverts the successfully-applied prefix before the
/// error propagates, so no structural state leaks.
#[derive(Debug)]
pub struct Editor {
    edits: Vec<Edit>,
    /// How many edits are currently applied to the host.
    applied: usize,
}

impl Editor {
    /// Validate and record an edit list.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::StructuralEditConflict`] when two edits
    /// target the same path.
    pub fn new(edits: Vec<Edit>) -> Result<Self> {
        for (i, edit) in edits.iter().enumerate() {
            let target = edit.target();
            if edits[..i].iter().any(|other| other.target() == target) {
                return Err(WeaveError::StructuralEditConflict { path: target });
            }
        }
        Ok(Self { edits, applied: 0 })
    }

    /// The recorded edits.
    #[must_use]
    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    /// Apply all edits to the live host, in order.
    ///
    /// # Errors
    ///
    /// On a mid-list failure the applied prefix is reverted in reverse
    /// order, then the failing edit's error propagates.
    pub fn apply<H: HostModel>(&mut self, host: &mut H) -> Result<()> {
        for (i, edit) in self.edits.iter().enumerate() {
            if let Err(err) = edit.apply_host(host) {
                for done in self.edits[..i].iter().rev() {
                    // Nothing useful to do with a secondary revert
                    // failure while unwinding; the original error wins.
                    let _ = done.revert_host(host);
                }
                self.applied = 0;
                return Err(err);
            }
        }
        self.applied = self.edits.len();
        debug!(edits = self.applied, "edits applied");
        Ok(())
    }

    /// Revert every currently-applied edit, in reverse order. Idempotent.
    ///
    /// # Errors
    ///
    /// All reverts are attempted; the first failure is returned.
    pub fn revert<H: HostModel>(&mut self, host: &mut H) -> Result<()> {
        let mut first_err = None;
        for edit in self.edits[..self.applied].iter().rev() {
            if let Err(err) = edit.revert_host(host) {
                first_err.get_or_insert(err);
            }
        }
        if self.applied > 0 {
            debug!(edits = self.applied, "edits reverted");
        }
        self.applied = 0;
        first_err.map_or(Ok(()), Err)
    }

    /// Apply all edits to the shape-only mirror, reverting the applied
    /// prefix on mid-list failure.
    ///
    /// # Errors
    ///
    /// Propagates the failing edit's error after unwinding the prefix.
    pub fn apply_to_mirror(&self, mirror: &mut ShapeMirror) -> Result<()> {
        for (i, edit) in self.edits.iter().enumerate() {
            if let Err(err) = edit.apply_mirror(mirror) {
                for done in self.edits[..i].iter().rev() {
                    let _ = done.revert_mirror(mirror);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Revert all edits from the shape-only mirror, in reverse order.
    ///
    /// # Errors
    ///
    /// All reverts are attempted; the first failure is returned.
    pub fn revert_from_mirror(&self, mirror: &mut ShapeMirror) -> Result<()> {
        let mut first_err = None;
        for edit in self.edits.iter().rev() {
            if let Err(err) = edit.revert_mirror(mirror) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Run `f` with the edits applied, reverting on every exit path.
    ///
    /// # Errors
    ///
    /// Propagates conflicts from [`Editor::new`], apply failures, `f`'s
    /// error, or (when `f` succeeded) a revert failure.
    pub fn scoped<H, T>(
        host: &mut H,
        edits: Vec<Edit>,
        f: impl FnOnce(&mut H) -> Result<T>,
    ) -> Result<T>
    where
        H: HostModel,
    {
        let mut editor = Self::new(edits)?;
        editor.apply(host)?;
        let result = f(host);
        let reverted = editor.revert(host);
        match (result, reverted) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use candle_core::{Device, Tensor};

    /// Minimal host: a flat module list supporting pass-through insertion.
    struct FlatHost {
        paths: Vec<ModulePath>,
    }

    impl FlatHost {
        fn new(paths: &[&str]) -> Self {
            Self {
                paths: paths.iter().map(|p| ModulePath::new(*p)).collect(),
            }
        }
    }

    impl HostModel for FlatHost {
        fn module_paths(&self) -> Vec<ModulePath> {
            self.paths.clone()
        }

        fn run(
            &mut self,
            input: Tensor,
            _observer: &mut dyn crate::Observer,
        ) -> Result<Tensor> {
            Ok(input)
        }

        fn insert_passthrough(&mut self, parent: &ModulePath, name: &str) -> Result<()> {
            if !self.paths.contains(parent) {
                return Err(WeaveError::Host(format!("no module at `{parent}`")));
            }
            self.paths.push(parent.child(name));
            Ok(())
        }

        fn remove_passthrough(&mut self, path: &ModulePath) -> Result<()> {
            let before = self.paths.len();
            self.paths.retain(|p| p != path);
            if self.paths.len() == before {
                return Err(WeaveError::Host(format!("no module at `{path}`")));
            }
            Ok(())
        }

        fn trace_shapes(
            &self,
            _input: &crate::TensorSpec,
            _record: &mut dyn FnMut(&ModulePath, crate::Direction, &crate::TensorSpec),
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn conflicting_targets_are_rejected_up_front() {
        let err = Editor::new(vec![
            Edit::insert_wrapper("a", "probe"),
            Edit::insert_wrapper("a", "probe"),
        ])
        .unwrap_err();
        assert!(
            matches!(err, WeaveError::StructuralEditConflict { path } if path.as_str() == "a.probe")
        );
    }

    #[test]
    fn apply_then_revert_restores_structure() {
        let mut host = FlatHost::new(&["a", "b"]);
        let original = host.paths.clone();

        let mut editor = Editor::new(vec![
            Edit::insert_wrapper("a", "probe"),
            Edit::insert_wrapper("b", "tap"),
        ])
        .unwrap();
        editor.apply(&mut host).unwrap();
        assert_eq!(host.paths.len(), 4);

        editor.revert(&mut host).unwrap();
        assert_eq!(host.paths, original);
        // Idempotent.
        editor.revert(&mut host).unwrap();
        assert_eq!(host.paths, original);
    }

    #[test]
    fn partial_apply_failure_reverts_prefix() {
        let mut host = FlatHost::new(&["a"]);
        let original = host.paths.clone();

        let mut editor = Editor::new(vec![
            Edit::insert_wrapper("a", "probe"),
            // `ghost` does not exist: this edit fails mid-list.
            Edit::insert_wrapper("ghost", "tap"),
        ])
        .unwrap();
        let err = editor.apply(&mut host).unwrap_err();
        assert!(matches!(err, WeaveError::Host(_)));
        assert_eq!(host.paths, original);
    }

    #[test]
    fn scoped_reverts_when_the_body_errors() {
        let mut host = FlatHost::new(&["a"]);
        let original = host.paths.clone();

        let result: Result<()> =
            Editor::scoped(&mut host, vec![Edit::insert_wrapper("a", "probe")], |host| {
                assert!(host.paths.contains(&ModulePath::new("a.probe")));
                Err(WeaveError::Host("boom".into()))
            });
        assert!(result.is_err());
        assert_eq!(host.paths, original);
    }

    #[test]
    fn mirror_edits_round_trip() {
        let mut mirror = ShapeMirror::from_paths(["a"]);
        let mut graph = Graph::new();
        let node = graph.literal(Tensor::new(1.0f32, &Device::Cpu).unwrap());
        let original = mirror.clone();

        let editor = Editor::new(vec![
            Edit::insert_wrapper("a", "probe"),
            Edit::graph_patch("a", &node),
        ])
        .unwrap();
        editor.apply_to_mirror(&mut mirror).unwrap();
        assert!(mirror.contains(&ModulePath::new("a.probe")));
        assert_eq!(mirror.producer(&ModulePath::new("a")), Some(node.name()));

        editor.revert_from_mirror(&mut mirror).unwrap();
        assert_eq!(mirror, original);
    }
}
