// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system bridging the host's eager execution to the graph's lazy
//! evaluation.
//!
//! Provides [`Observer`] (the callback hosts invoke at every module
//! boundary), [`HookManager`] (attaches observation points for exactly
//! the modules a graph references), and [`HookSession`] (the live,
//! detach-safe attachment for one execution).
//!
//! The increment hook is folded into the session: when the host's
//! designated per-step boundary produces its output, sibling nodes at
//! that point resolve first, then the graph's iteration counter
//! advances. Its lifecycle is identical to every other hook.

use candle_core::Tensor;
use indexmap::IndexSet;
use tracing::debug;

use crate::error::Result;
use crate::graph::Graph;
use crate::path::{Direction, ModulePath, ObservationPoint};

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Callback a host invokes at each module boundary it visits.
///
/// The host passes the live value in; whatever comes back is the value
/// the host continues with. Repeated visits to the same module within
/// one execution are distinct events; deduplication, where needed, is
/// the graph's responsibility via its iteration state.
pub trait Observer {
    /// Observe (and possibly rewrite) the value at a module boundary.
    ///
    /// # Errors
    ///
    /// Implementations propagate graph resolution failures, which abort
    /// the host execution in progress.
    fn observe(
        &mut self,
        path: &ModulePath,
        direction: Direction,
        value: Tensor,
    ) -> Result<Tensor>;
}

// ---------------------------------------------------------------------------
// HookManager / HookSession
// ---------------------------------------------------------------------------

/// Installs observation points for the duration of exactly one host
/// execution.
pub struct HookManager;

impl HookManager {
    /// Attach hooks for every module path the graph references, plus the
    /// host's increment point when given, and return the live session.
    ///
    /// The session borrows the graph exclusively: concurrent executions
    /// against the same compiled graph are ruled out by construction.
    pub fn begin(graph: &mut Graph, increment_point: Option<ModulePath>) -> HookSession<'_> {
        let hooked = graph.observed_paths();
        debug!(paths = hooked.len(), "hooks attached");
        HookSession {
            graph,
            hooked,
            increment_point,
            detached: false,
        }
    }
}

/// Live hook attachment for one host execution.
///
/// Implements [`Observer`]: hooked paths dispatch to
/// [`Graph::resolve`]; everything else passes through untouched.
/// [`end`](HookSession::end) detaches and is safe to call on every exit
/// path — twice, after an error, or not at all (drop detaches too), so
/// no observation point ever dangles.
pub struct HookSession<'g> {
    graph: &'g mut Graph,
    /// Paths the compiled graph references; only these dispatch.
    hooked: IndexSet<ModulePath>,
    /// Boundary whose output marks one completed decoding step.
    increment_point: Option<ModulePath>,
    detached: bool,
}

impl HookSession<'_> {
    /// Detach all hooks. Idempotent; observations after detach pass
    /// values through unchanged.
    pub fn end(&mut self) {
        if !self.detached {
            self.detached = true;
            debug!("hooks detached");
        }
    }

    /// Whether the session has been detached.
    #[must_use]
    pub const fn is_detached(&self) -> bool {
        self.detached
    }
}

impl Observer for HookSession<'_> {
    fn observe(
        &mut self,
        path: &ModulePath,
        direction: Direction,
        value: Tensor,
    ) -> Result<Tensor> {
        if self.detached {
            return Ok(value);
        }
        // Resolution first, so nodes meant for iteration k finish before
        // the counter advances to k+1.
        let value = if self.hooked.contains(path) {
            let point = ObservationPoint {
                path: path.clone(),
                direction,
            };
            self.graph.resolve(&point, value)?.value
        } else {
            value
        };
        if direction == Direction::Output && self.increment_point.as_ref() == Some(path) {
            self.graph.increment();
        }
        Ok(value)
    }
}

impl Drop for HookSession<'_> {
    fn drop(&mut self) {
        self.end();
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

    fn scalar(v: f32) -> Tensor {
        Tensor::new(v, &Device::Cpu).unwrap()
    }

    #[test]
    fn hooked_paths_dispatch_to_graph() {
        let mut graph = Graph::new();
        let a = graph.observe(ObservationPoint::output("layer0")).unwrap();

        {
            let mut session = HookManager::begin(&mut graph, None);
            session
                .observe(&ModulePath::new("layer0"), Direction::Output, scalar(5.0))
                .unwrap();
            // Unreferenced path: passes through, graph untouched.
            let out = session
                .observe(&ModulePath::new("layer1"), Direction::Output, scalar(9.0))
                .unwrap();
            assert_eq!(out.to_scalar::<f32>().unwrap(), 9.0);
        }

        assert_eq!(graph.value(&a).unwrap().to_scalar::<f32>().unwrap(), 5.0);
    }

    #[test]
    fn end_is_idempotent_and_detaches() {
        let mut graph = Graph::new();
        let a = graph.observe(ObservationPoint::output("layer0")).unwrap();

        let mut session = HookManager::begin(&mut graph, None);
        session.end();
        session.end();
        assert!(session.is_detached());

        // Detached sessions pass everything through without resolving.
        let out = session
            .observe(&ModulePath::new("layer0"), Direction::Output, scalar(5.0))
            .unwrap();
        assert_eq!(out.to_scalar::<f32>().unwrap(), 5.0);
        drop(session);
        assert!(graph.value(&a).is_none());
    }

    #[test]
    fn increment_fires_after_resolution_at_its_point() {
        let mut graph = Graph::new();
        // Node bound to iteration 0 at the increment point itself: it
        // must bind before the counter advances.
        let head = graph
            .observe_at(ObservationPoint::output("head"), 0)
            .unwrap();

        let mut session = HookManager::begin(&mut graph, Some(ModulePath::new("head")));
        session
            .observe(&ModulePath::new("head"), Direction::Output, scalar(1.0))
            .unwrap();
        session
            .observe(&ModulePath::new("head"), Direction::Output, scalar(2.0))
            .unwrap();
        drop(session);

        // First visit bound at step 0, counter advanced twice.
        assert_eq!(graph.value(&head).unwrap().to_scalar::<f32>().unwrap(), 1.0);
        assert_eq!(graph.iteration(), 2);
    }

    #[test]
    fn increment_point_advances_even_when_unhooked() {
        let mut graph = Graph::new();
        graph.observe(ObservationPoint::output("layer0")).unwrap();

        let mut session = HookManager::begin(&mut graph, Some(ModulePath::new("head")));
        session
            .observe(&ModulePath::new("head"), Direction::Output, scalar(0.0))
            .unwrap();
        // Input observations at the increment point do not advance.
        session
            .observe(&ModulePath::new("head"), Direction::Input, scalar(0.0))
            .unwrap();
        drop(session);

        assert_eq!(graph.iteration(), 1);
    }
}
