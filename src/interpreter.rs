// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution orchestration: ties graph, edits, hooks, and host together
//! for one interleaved run.
//!
//! An [`Interpreter`] owns a [`HostModel`] and its shape-only mirror.
//! Each execution follows the same sequence: reset the graph's per-run
//! state, apply recorded structural edits, compile the graph against the
//! (edited) host, attach hooks, run, detach, revert. Edits are reverted
//! and hooks detached on every error path, so the host's structure and
//! the graph's reusability survive failed runs.

use candle_core::Tensor;
use tracing::debug;

use crate::edit::{Edit, Editor};
use crate::error::Result;
use crate::graph::{Graph, NodeRef};
use crate::hooks::HookManager;
use crate::host::{HostModel, HostNamespace};
use crate::mirror::{ShapeMirror, TensorSpec};
use crate::path::ModulePath;
use crate::scan::scan;

/// Owns a host model, its scanned mirror, and the persistent edits that
/// expose extra observation points.
pub struct Interpreter<H: HostModel> {
    host: H,
    mirror: ShapeMirror,
    /// Structural edits applied to the live host around every execution.
    edits: Vec<Edit>,
}

impl<H: HostModel> Interpreter<H> {
    /// Wrap a host: builds the shape-only mirror from the host's module
    /// paths and runs the one-time shape-inference pass over it with a
    /// representative input spec.
    ///
    /// # Errors
    ///
    /// Propagates scan failures ([`WeaveError::Host`]).
    ///
    /// [`WeaveError::Host`]: crate::WeaveError::Host
    pub fn new(host: H, sample_input: &TensorSpec) -> Result<Self> {
        let mut mirror = ShapeMirror::from_paths(host.module_paths());
        scan(&host, sample_input, &mut mirror)?;
        debug!(modules = mirror.paths().len(), "host mirrored and scanned");
        Ok(Self {
            host,
            mirror,
            edits: Vec::new(),
        })
    }

    /// The shape-only mirror.
    #[must_use]
    pub const fn mirror(&self) -> &ShapeMirror {
        &self.mirror
    }

    /// The wrapped host.
    #[must_use]
    pub const fn host(&self) -> &H {
        &self.host
    }

    /// A fresh graph that validates construction against the scanned
    /// mirror.
    #[must_use]
    pub fn graph(&self) -> Graph {
        Graph::against(&self.mirror)
    }

    /// Expose an intermediate value as an independently observable
    /// module: inserts an identity wrapper named `name` under `parent`
    /// and declares `producer` as the value flowing through it.
    ///
    /// The mirror is patched immediately; the live host is patched
    /// around every subsequent execution and restored afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::StructuralEditConflict`] when the wrapper
    /// path is already edited, or mirror errors for a missing `parent`.
    ///
    /// [`WeaveError::StructuralEditConflict`]: crate::WeaveError::StructuralEditConflict
    pub fn modulize(
        &mut self,
        parent: &ModulePath,
        name: &str,
        producer: &NodeRef,
    ) -> Result<ModulePath> {
        let wrapper = Edit::insert_wrapper(parent.clone(), name);
        let patch = Edit::graph_patch(parent.clone(), producer);

        // Validate against already-recorded edits before touching state.
        let mut candidate = self.edits.clone();
        candidate.push(wrapper.clone());
        candidate.push(patch.clone());
        Editor::new(candidate)?;

        wrapper.apply_mirror(&mut self.mirror)?;
        if let Err(err) = patch.apply_mirror(&mut self.mirror) {
            let _ = wrapper.revert_mirror(&mut self.mirror);
            return Err(err);
        }
        self.edits.push(wrapper);
        self.edits.push(patch);
        debug!(path = %parent.child(name), "modulized");
        Ok(parent.child(name))
    }

    /// Run the host once, interleaving the graph's deferred computation.
    ///
    /// Node values remain inspectable on `graph` after the call;
    /// unresolved nodes are a normal outcome when the host skipped their
    /// observation points.
    ///
    /// # Errors
    ///
    /// Compile errors surface before any execution side effects; runtime
    /// conflicts abort the run after edits revert and hooks detach.
    pub fn execute(&mut self, graph: &mut Graph, input: Tensor) -> Result<Tensor> {
        self.run_with(graph, input, None)
    }

    /// Run the host's iterative decoding loop for `steps` steps.
    ///
    /// The graph's iteration counter advances once per step via the
    /// host's increment point.
    ///
    /// # Errors
    ///
    /// See [`Interpreter::execute`].
    pub fn execute_iterative(
        &mut self,
        graph: &mut Graph,
        input: Tensor,
        steps: usize,
    ) -> Result<Tensor> {
        self.run_with(graph, input, Some(steps))
    }

    fn run_with(
        &mut self,
        graph: &mut Graph,
        input: Tensor,
        steps: Option<usize>,
    ) -> Result<Tensor> {
        graph.reset();

        let mut editor = Editor::new(self.edits.clone())?;
        editor.apply(&mut self.host)?;

        let result = (|| {
            // Compile against the edited host, so wrapper paths resolve.
            graph.compile(&HostNamespace(&self.host))?;
            let increment_point = self.host.increment_point();
            let mut session = HookManager::begin(graph, increment_point);
            let output = match steps {
                None => self.host.run(input, &mut session),
                Some(n) => self.host.run_iterative(input, n, &mut session),
            };
            session.end();
            output
        })();

        let reverted = editor.revert(&mut self.host);
        match (result, reverted) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(output), Ok(())) => {
                debug!(
                    unresolved = graph.unresolved().len(),
                    iterations = graph.iteration(),
                    "execution complete"
                );
                Ok(output)
            }
        }
    }
}
