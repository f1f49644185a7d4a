// Input generation — randomized samples consistent with declared shapes
//
// Each next_sample() call yields one fresh input tuple. Fixed inputs reuse
// the example shapes verbatim; dynamic dimensions draw one base value per
// symbolic name per sample (bounded to [max(min,1), min(max,1000)]) and
// derive concrete sizes from it, so two inputs sharing a name always agree
// within a sample.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vole_core::dynamic_shape::{DimEnv, DynamicShapeSpec};
use vole_core::{bail, DType, Result, Tensor};

/// Random input-tuple generator over example inputs + dynamic-shape specs.
pub struct RandomInputs<'a> {
    example_inputs: &'a [Tensor],
    dynamic_shapes: Option<&'a [DynamicShapeSpec]>,
    rng: StdRng,
}

impl<'a> RandomInputs<'a> {
    pub fn new(
        example_inputs: &'a [Tensor],
        dynamic_shapes: Option<&'a [DynamicShapeSpec]>,
    ) -> Self {
        Self::with_rng(example_inputs, dynamic_shapes, StdRng::from_entropy())
    }

    /// Deterministic generator for tests.
    pub fn with_seed(
        example_inputs: &'a [Tensor],
        dynamic_shapes: Option<&'a [DynamicShapeSpec]>,
        seed: u64,
    ) -> Self {
        Self::with_rng(example_inputs, dynamic_shapes, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        example_inputs: &'a [Tensor],
        dynamic_shapes: Option<&'a [DynamicShapeSpec]>,
        rng: StdRng,
    ) -> Self {
        RandomInputs {
            example_inputs,
            dynamic_shapes,
            rng,
        }
    }

    /// One fresh input tuple.
    pub fn next_sample(&mut self) -> Result<Vec<Tensor>> {
        if let Some(specs) = self.dynamic_shapes {
            if specs.len() != self.example_inputs.len() {
                bail!(
                    "got {} dynamic shape specs for {} inputs",
                    specs.len(),
                    self.example_inputs.len()
                );
            }
        }
        let mut env = DimEnv::new();
        let mut sample = Vec::with_capacity(self.example_inputs.len());
        for (index, example) in self.example_inputs.iter().enumerate() {
            if example.dtype() != DType::F32 {
                bail!("can only generate random F32 inputs, input {index} is {}", example.dtype());
            }
            let mut dims = example.dims().to_vec();
            if let Some(spec) = self.dynamic_shapes.map(|s| &s[index]) {
                spec.validate_against(example.dims())?;
                for (dim_idx, dyn_dim) in spec.dims() {
                    dims[dim_idx] = env.resolve(dyn_dim, |lo, hi| self.rng.gen_range(lo..=hi));
                }
            }
            sample.push(Tensor::randn(dims, &mut self.rng));
        }
        Ok(sample)
    }
}

impl Iterator for RandomInputs<'_> {
    type Item = Result<Vec<Tensor>>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_sample())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::dynamic_shape::DynDim;

    fn double(x: usize) -> usize {
        2 * x
    }

    #[test]
    fn test_fixed_shapes_reused() {
        let example = [Tensor::zeros([1, 3, 4, 4]), Tensor::zeros([2, 5])];
        let mut generator = RandomInputs::with_seed(&example, None, 0);
        for _ in 0..3 {
            let sample = generator.next_sample().unwrap();
            assert_eq!(sample[0].dims(), &[1, 3, 4, 4]);
            assert_eq!(sample[1].dims(), &[2, 5]);
        }
    }

    #[test]
    fn test_derived_dim_in_range() {
        let example = [Tensor::zeros([4, 3])];
        let specs = [DynamicShapeSpec::new().with_dim(0, DynDim::derived("d", 2, 1000, double))];
        let mut generator = RandomInputs::with_seed(&example, Some(&specs), 7);
        for _ in 0..20 {
            let sample = generator.next_sample().unwrap();
            let dim = sample[0].dims()[0];
            // dim = 2*v for some v in [2, 1000]
            assert_eq!(dim % 2, 0);
            let v = dim / 2;
            assert!((2..=1000).contains(&v), "base draw {v} out of range");
            assert_eq!(sample[0].dims()[1], 3);
        }
    }

    #[test]
    fn test_shared_name_consistent_across_inputs() {
        let example = [Tensor::zeros([4, 3]), Tensor::zeros([8, 3])];
        let specs = [
            DynamicShapeSpec::new().with_dim(0, DynDim::new("batch", 2, 64)),
            DynamicShapeSpec::new().with_dim(0, DynDim::derived("batch", 2, 64, double)),
        ];
        let mut generator = RandomInputs::with_seed(&example, Some(&specs), 42);
        for _ in 0..20 {
            let sample = generator.next_sample().unwrap();
            let base = sample[0].dims()[0];
            assert_eq!(sample[1].dims()[0], 2 * base);
        }
    }

    #[test]
    fn test_samples_vary_between_calls() {
        let example = [Tensor::zeros([2, 2])];
        let mut generator = RandomInputs::with_seed(&example, None, 3);
        let a = generator.next_sample().unwrap();
        let b = generator.next_sample().unwrap();
        assert_ne!(a[0].to_f32_vec(), b[0].to_f32_vec());
    }
}
