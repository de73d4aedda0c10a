// SPDX-License-Identifier: MIT OR Apache-2.0

//! Module addressing: dotted paths, observation directions, and the
//! namespace facade hosts expose to the engine.
//!
//! A host model is opaque to the engine beyond its hierarchical namespace
//! of addressable sub-computations. Every location the engine can observe
//! is a [`ModulePath`] plus a [`Direction`], bundled as an
//! [`ObservationPoint`].

use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// ModulePath
// ---------------------------------------------------------------------------

/// Dotted path addressing one sub-computation inside a host model,
/// e.g. `transformer.h.5.mlp`.
///
/// # String conversion
///
/// ```
/// use candle_weave::ModulePath;
///
/// let path = ModulePath::new("transformer.h.5");
/// assert_eq!(path.to_string(), "transformer.h.5");
/// assert_eq!(path.parent(), Some(ModulePath::new("transformer.h")));
/// assert_eq!(path.child("mlp").to_string(), "transformer.h.5.mlp");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModulePath(String);

impl ModulePath {
    /// Create a path from a dotted string.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The raw dotted string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments, split on `.`.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// The enclosing module's path, or `None` for a top-level module.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0.rsplit_once('.').map(|(head, _)| Self(head.to_string()))
    }

    /// Final path segment (the module's own name).
    #[must_use]
    pub fn leaf(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// Path of a child module under this one.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        if self.0.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}.{name}", self.0))
        }
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModulePath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ModulePath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl FromStr for ModulePath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Which side of a module boundary a value is observed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The value flowing into the module, observed before it executes.
    Input,
    /// The value the module produced, observed after it executes.
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

// ---------------------------------------------------------------------------
// ObservationPoint
// ---------------------------------------------------------------------------

/// A (module path, direction) pair at which the host's value becomes
/// visible to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObservationPoint {
    /// Path of the observed module.
    pub path: ModulePath,
    /// Side of the boundary being observed.
    pub direction: Direction,
}

impl ObservationPoint {
    /// Observation of a module's input.
    pub fn input(path: impl Into<ModulePath>) -> Self {
        Self {
            path: path.into(),
            direction: Direction::Input,
        }
    }

    /// Observation of a module's output.
    pub fn output(path: impl Into<ModulePath>) -> Self {
        Self {
            path: path.into(),
            direction: Direction::Output,
        }
    }
}

impl fmt::Display for ObservationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.direction)
    }
}

// ---------------------------------------------------------------------------
// ModuleNamespace
// ---------------------------------------------------------------------------

/// Explicit path-lookup facade over a hierarchical module tree.
///
/// Both the live host and the shape-only mirror answer structural
/// queries through this trait; [`Graph::compile`](crate::Graph::compile)
/// accepts either.
pub trait ModuleNamespace {
    /// Whether a module exists at `path`.
    fn contains_path(&self, path: &ModulePath) -> bool;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn path_segments_and_parent() {
        let path = ModulePath::new("transformer.h.5.mlp");
        let segments: Vec<&str> = path.segments().collect();
        assert_eq!(segments, vec!["transformer", "h", "5", "mlp"]);
        assert_eq!(path.leaf(), "mlp");
        assert_eq!(path.parent().unwrap().to_string(), "transformer.h.5");

        let top = ModulePath::new("embed");
        assert_eq!(top.parent(), None);
        assert_eq!(top.leaf(), "embed");
    }

    #[test]
    fn path_child_and_display() {
        let path = ModulePath::new("blocks.0");
        assert_eq!(path.child("attn").to_string(), "blocks.0.attn");

        let parsed: ModulePath = "blocks.0.attn".parse().unwrap();
        assert_eq!(parsed, path.child("attn"));
    }

    #[test]
    fn observation_point_display() {
        assert_eq!(
            ObservationPoint::output("layer0").to_string(),
            "layer0:output"
        );
        assert_eq!(ObservationPoint::input("layer0").to_string(), "layer0:input");
        assert_ne!(
            ObservationPoint::input("layer0"),
            ObservationPoint::output("layer0")
        );
    }
}
