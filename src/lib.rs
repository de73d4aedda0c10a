// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-weave
//!
//! Deferred intervention graphs over the internal activations of an
//! externally-defined host model, in pure Rust on
//! [candle](https://github.com/huggingface/candle).
//!
//! candle-weave records a symbolic computation (a [`Graph`] of
//! [`NodeRef`] handles) against named observation points inside a host
//! model, then executes the host so that, at precisely the points where
//! each named internal value becomes available, the deferred computation
//! resolves against the live value and may read or overwrite it before
//! the host continues (following the `nnsight` interleaving design).
//!
//! ## Pieces
//!
//! - [`Graph`] — the node arena, dependency resolution, and the
//!   `resolve` interleaving protocol, including write-backs and
//!   per-iteration firing for autoregressive hosts.
//! - [`HookManager`] / [`HookSession`] — attaches observation points for
//!   exactly the modules a compiled graph references, detach-safe on
//!   every exit path.
//! - [`Editor`] / [`Edit`] — reversible structural patches that expose
//!   new observation points, reverted in reverse order even on failure.
//! - [`ShapeMirror`] + [`scan()`] — a shape/dtype-only structural copy of
//!   the host, populated by a one-time metadata dry run, backing static
//!   validation of graph construction.
//! - [`HostModel`] — the capability interface concrete model families
//!   implement; loading, tokenization, and device placement live behind
//!   it, out of the engine's scope.
//! - [`Interpreter`] — owns a host and its mirror, orchestrating
//!   reset → edit → compile → hook → run → detach → revert.

#![deny(warnings)]
#![warn(missing_docs)]

mod edit;
mod error;
mod graph;
mod hooks;
mod host;
mod interpreter;
mod mirror;
mod path;
mod scan;

pub use edit::{Edit, Editor};
pub use error::{Result, WeaveError};
pub use graph::{Arg, Graph, Node, NodeRef, Operation, Resolution, Schedule, TensorOp};
pub use hooks::{HookManager, HookSession, Observer};
pub use host::{HostModel, HostNamespace};
pub use interpreter::Interpreter;
pub use mirror::{MirrorModule, ShapeMirror, TensorSpec};
pub use path::{Direction, ModuleNamespace, ModulePath, ObservationPoint};
pub use scan::scan;
