// Dynamic shapes — bounded symbolic dimensions with derived sizes
//
// A model input may declare that some of its dimensions vary at runtime.
// Each varying dimension names a symbolic base dimension with an inclusive
// [min, max] range and a derivation function mapping the base draw to the
// concrete size (e.g. an input whose width is always twice the batch).
//
// COMPONENTS:
//
//   DynDim           — one symbolic dimension: name + bounds + derivation
//   DynamicShapeSpec — per-input mapping from dimension index to DynDim
//   DimEnv           — one base draw per symbolic name within a sample
//
// The consistency rule: within one generated sample, every dimension that
// references the same symbolic name resolves from the same base draw, even
// across different inputs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{Error, Result};

/// Derivation from the symbolic base draw to a concrete dimension size.
pub type DeriveFn = fn(usize) -> usize;

fn derive_identity(x: usize) -> usize {
    x
}

/// A symbolic dimension: a named base value in `[min, max]` plus a
/// derivation applied to it.
#[derive(Clone)]
pub struct DynDim {
    name: String,
    min: usize,
    max: usize,
    derive: DeriveFn,
}

impl DynDim {
    /// A plain symbolic dimension: size is the base draw itself.
    pub fn new(name: impl Into<String>, min: usize, max: usize) -> Self {
        DynDim {
            name: name.into(),
            min,
            max,
            derive: derive_identity,
        }
    }

    /// A derived dimension: size is `derive(base draw)`.
    pub fn derived(name: impl Into<String>, min: usize, max: usize, derive: DeriveFn) -> Self {
        DynDim {
            name: name.into(),
            min,
            max,
            derive,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Apply the derivation to a base value.
    pub fn derive(&self, base: usize) -> usize {
        (self.derive)(base)
    }

    /// Bounds actually used when sampling: lower clamped to at least 1,
    /// upper clamped to at most 1000 (unbounded maxima are impractical).
    pub fn sample_bounds(&self) -> (usize, usize) {
        (self.min.max(1), self.max.min(1000))
    }

    /// The largest concrete size this dimension can take under the
    /// sampling bounds. Used by upper-bound symbolic shape evaluation.
    pub fn upper_bound(&self) -> usize {
        self.derive(self.sample_bounds().1)
    }
}

impl fmt::Debug for DynDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DynDim({}, {}..={})", self.name, self.min, self.max)
    }
}

/// Dynamic-shape declaration for one model input: dimension index → DynDim.
///
/// Dimensions not present in the map are fixed to the example shape.
/// A BTreeMap keeps iteration order stable across runs.
#[derive(Debug, Clone, Default)]
pub struct DynamicShapeSpec {
    dims: BTreeMap<usize, DynDim>,
}

impl DynamicShapeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare dimension `dim_idx` as dynamic.
    pub fn with_dim(mut self, dim_idx: usize, dim: DynDim) -> Self {
        self.dims.insert(dim_idx, dim);
        self
    }

    pub fn dims(&self) -> impl Iterator<Item = (usize, &DynDim)> {
        self.dims.iter().map(|(&i, d)| (i, d))
    }

    pub fn get(&self, dim_idx: usize) -> Option<&DynDim> {
        self.dims.get(&dim_idx)
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Check the spec is consistent with a concrete example shape: every
    /// declared dimension index must exist in the shape.
    pub fn validate_against(&self, example_dims: &[usize]) -> Result<()> {
        for (&idx, dim) in &self.dims {
            if idx >= example_dims.len() {
                return Err(Error::msg(format!(
                    "dynamic dim index {} out of range for example shape of rank {} (dim '{}')",
                    idx,
                    example_dims.len(),
                    dim.name()
                )));
            }
        }
        Ok(())
    }
}

/// Base-draw environment for one generated sample.
///
/// The first resolution of a symbolic name fixes its base draw; later
/// resolutions of the same name reuse it.
#[derive(Debug, Default)]
pub struct DimEnv {
    draws: HashMap<String, usize>,
}

impl DimEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a dimension to its concrete size, drawing the base value via
    /// `draw` only if this name has not been seen yet in this environment.
    pub fn resolve(&mut self, dim: &DynDim, draw: impl FnOnce(usize, usize) -> usize) -> usize {
        let base = *self
            .draws
            .entry(dim.name().to_string())
            .or_insert_with(|| {
                let (lo, hi) = dim.sample_bounds();
                draw(lo, hi)
            });
        dim.derive(base)
    }

    /// The base draw recorded for a name, if any.
    pub fn base(&self, name: &str) -> Option<usize> {
        self.draws.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(x: usize) -> usize {
        2 * x
    }

    #[test]
    fn test_sample_bounds_clamped() {
        let d = DynDim::new("n", 0, 1_000_000);
        assert_eq!(d.sample_bounds(), (1, 1000));
        let d = DynDim::new("n", 2, 16);
        assert_eq!(d.sample_bounds(), (2, 16));
    }

    #[test]
    fn test_derived_dim() {
        let d = DynDim::derived("n", 2, 8, double);
        assert_eq!(d.derive(3), 6);
        assert_eq!(d.upper_bound(), 16);
    }

    #[test]
    fn test_env_shares_base_draw_across_uses() {
        let a = DynDim::new("batch", 2, 10);
        let b = DynDim::derived("batch", 2, 10, double);
        let mut env = DimEnv::new();
        let size_a = env.resolve(&a, |lo, _hi| lo + 3);
        // Same name: the draw closure must not run again.
        let size_b = env.resolve(&b, |_lo, _hi| panic!("second draw for same name"));
        assert_eq!(size_a, 5);
        assert_eq!(size_b, 10);
        assert_eq!(env.base("batch"), Some(5));
    }

    #[test]
    fn test_spec_validates_dim_index() {
        let spec = DynamicShapeSpec::new().with_dim(3, DynDim::new("n", 1, 4));
        assert!(spec.validate_against(&[2, 3]).is_err());
        assert!(spec.validate_against(&[2, 3, 4, 5]).is_ok());
    }
}
