// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shape-inference pass over the shape-only mirror.
//!
//! Runs once, right after the mirror is constructed: a metadata-only dry
//! run through the host that records each reachable module's input and
//! output spec. No real computation happens. Graphs built
//! [`against`](crate::Graph::against) the populated mirror can then
//! reject shape-incompatible construction before any expensive real
//! execution is attempted.

use tracing::debug;

use crate::error::Result;
use crate::host::HostModel;
use crate::mirror::{ShapeMirror, TensorSpec};
use crate::path::ObservationPoint;

/// Populate `mirror` with the specs observed while propagating
/// `input` through the host's structure.
///
/// # Errors
///
/// Returns [`WeaveError::Host`](crate::WeaveError::Host) when the host
/// reports a module path the mirror does not contain, or when the host
/// cannot propagate the spec at all.
pub fn scan<H: HostModel + ?Sized>(
    host: &H,
    input: &TensorSpec,
    mirror: &mut ShapeMirror,
) -> Result<()> {
    let mut recorded = 0usize;
    let mut failure = None;
    host.trace_shapes(input, &mut |path, direction, spec| {
        if failure.is_some() {
            return;
        }
        let point = ObservationPoint {
            path: path.clone(),
            direction,
        };
        match mirror.record(&point, spec.clone()) {
            Ok(()) => recorded += 1,
            Err(err) => failure = Some(err),
        }
    })?;
    if let Some(err) = failure {
        return Err(err);
    }
    debug!(specs = recorded, "scan complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Tensor};

    use crate::error::WeaveError;
    use crate::hooks::Observer;
    use crate::path::{Direction, ModulePath};

    /// Host whose trace reports a fixed spec at every listed module.
    struct TraceHost {
        paths: Vec<ModulePath>,
        /// Report one bogus path on top of the real ones.
        report_unknown: bool,
    }

    impl HostModel for TraceHost {
        fn module_paths(&self) -> Vec<ModulePath> {
            self.paths.clone()
        }

        fn run(&mut self, input: Tensor, _observer: &mut dyn Observer) -> Result<Tensor> {
            Ok(input)
        }

        fn insert_passthrough(&mut self, _parent: &ModulePath, _name: &str) -> Result<()> {
            Err(WeaveError::Host("static host".into()))
        }

        fn remove_passthrough(&mut self, _path: &ModulePath) -> Result<()> {
            Err(WeaveError::Host("static host".into()))
        }

        fn trace_shapes(
            &self,
            input: &TensorSpec,
            record: &mut dyn FnMut(&ModulePath, Direction, &TensorSpec),
        ) -> Result<()> {
            for path in &self.paths {
                record(path, Direction::Input, input);
                record(path, Direction::Output, input);
            }
            if self.report_unknown {
                record(&ModulePath::new("ghost"), Direction::Output, input);
            }
            Ok(())
        }
    }

    #[test]
    fn scan_populates_every_reported_point() {
        let host = TraceHost {
            paths: vec![ModulePath::new("layer0"), ModulePath::new("layer1")],
            report_unknown: false,
        };
        let mut mirror = ShapeMirror::from_paths(host.module_paths());
        let input = TensorSpec::new(vec![1, 8], DType::F32);
        scan(&host, &input, &mut mirror).unwrap();

        for path in ["layer0", "layer1"] {
            let spec = mirror
                .spec_at(&ObservationPoint::output(path))
                .unwrap();
            assert_eq!(spec.dims, vec![1, 8]);
            assert!(mirror.spec_at(&ObservationPoint::input(path)).is_some());
        }
    }

    #[test]
    fn scan_rejects_unknown_module_reports() {
        let host = TraceHost {
            paths: vec![ModulePath::new("layer0")],
            report_unknown: true,
        };
        let mut mirror = ShapeMirror::from_paths(host.module_paths());
        let input = TensorSpec::new(vec![4], DType::F32);
        let err = scan(&host, &input, &mut mirror).unwrap_err();
        assert!(matches!(err, WeaveError::Host(_)));
    }
}
