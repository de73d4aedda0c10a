// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host model capability interface.
//!
//! [`HostModel`] is the only contract a model family must satisfy to be
//! observed and intervened upon: a hierarchical namespace of module
//! paths, an execution entry point that reports every module boundary to
//! an [`Observer`], a structural-mutation interface for pass-through
//! insertion, and a metadata-only shape trace. Loading, dispatch,
//! tokenization, and device placement all live behind concrete
//! implementations of this trait and are out of the engine's scope.

use candle_core::Tensor;

use crate::error::Result;
use crate::hooks::Observer;
use crate::mirror::TensorSpec;
use crate::path::{Direction, ModuleNamespace, ModulePath};

/// Capability interface for an externally-defined hierarchical
/// computation.
///
/// Execution contract: `run` must call
/// [`Observer::observe`](crate::Observer::observe) with each visited
/// module's input before executing it and its output after, continuing
/// with whatever value the observer returns. A module visited twice
/// produces two distinct observation events.
pub trait HostModel {
    /// Every addressable module path, parents before children.
    fn module_paths(&self) -> Vec<ModulePath>;

    /// Run the host to completion over one input.
    ///
    /// # Errors
    ///
    /// Propagates observer failures (which abort the execution) and
    /// host-internal failures.
    fn run(&mut self, input: Tensor, observer: &mut dyn Observer) -> Result<Tensor>;

    /// Run the host iteratively for `steps` decoding steps.
    ///
    /// The default feeds each step's output back in as the next input;
    /// hosts with real decoding loops override this.
    ///
    /// # Errors
    ///
    /// See [`HostModel::run`].
    fn run_iterative(
        &mut self,
        input: Tensor,
        steps: usize,
        observer: &mut dyn Observer,
    ) -> Result<Tensor> {
        let mut value = input;
        for _ in 0..steps {
            value = self.run(value, observer)?;
        }
        Ok(value)
    }

    /// The module whose output marks one completed decoding step.
    ///
    /// Must be the last boundary the host visits in each loop body, so
    /// that nodes for step `k` resolve before the counter reaches
    /// `k + 1`. `None` for hosts without an iterative loop.
    fn increment_point(&self) -> Option<ModulePath> {
        None
    }

    /// Insert an identity pass-through module named `name` under
    /// `parent`, making a new point independently observable.
    ///
    /// # Errors
    ///
    /// Returns a host-reported error when `parent` does not exist or the
    /// name is taken.
    fn insert_passthrough(&mut self, parent: &ModulePath, name: &str) -> Result<()>;

    /// Remove a pass-through module previously inserted at `path`.
    ///
    /// # Errors
    ///
    /// Returns a host-reported error when no inserted module exists at
    /// `path`.
    fn remove_passthrough(&mut self, path: &ModulePath) -> Result<()>;

    /// Metadata-only dry run: propagate `input`'s spec through the module
    /// tree, reporting each boundary's spec to `record`. No real
    /// computation, no tensor allocation.
    ///
    /// # Errors
    ///
    /// Returns a host-reported error when the spec cannot be propagated.
    fn trace_shapes(
        &self,
        input: &TensorSpec,
        record: &mut dyn FnMut(&ModulePath, Direction, &TensorSpec),
    ) -> Result<()>;
}

/// Namespace facade over a host, for structural queries like
/// [`Graph::compile`](crate::Graph::compile).
///
/// Callers request modules by explicit path; there is no implicit
/// attribute-style delegation into the host.
pub struct HostNamespace<'h, H: HostModel + ?Sized>(pub &'h H);

impl<H: HostModel + ?Sized> ModuleNamespace for HostNamespace<'_, H> {
    fn contains_path(&self, path: &ModulePath) -> bool {
        self.0.module_paths().iter().any(|p| p == path)
    }
}
