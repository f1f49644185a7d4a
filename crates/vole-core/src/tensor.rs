// Tensor — CPU-resident n-dimensional array
//
// The pipeline only ever executes on the host reference interpreter, so a
// tensor is a shape plus a flat, row-major Vec of elements. Two storages
// exist: F32 for real values and I8 for quantized values. All arithmetic
// goes through f32; I8 tensors are produced and consumed only by the
// quantize/dequantize kernels.

use rand::Rng;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;

/// Flat element storage, tagged by dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F32(Vec<f32>),
    I8(Vec<i8>),
}

/// A CPU tensor: shape + row-major storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    storage: Storage,
}

impl Tensor {
    /// Create an F32 tensor from a data vector. The data length must match
    /// the shape's element count.
    pub fn from_f32(data: Vec<f32>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Tensor {
            shape,
            storage: Storage::F32(data),
        })
    }

    /// Create an I8 tensor from a data vector.
    pub fn from_i8(data: Vec<i8>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Tensor {
            shape,
            storage: Storage::I8(data),
        })
    }

    /// An F32 tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let n = shape.elem_count();
        Tensor {
            shape,
            storage: Storage::F32(vec![0.0; n]),
        }
    }

    /// An F32 tensor with standard-normal samples (Box-Muller over the
    /// supplied RNG, so generation is reproducible from a seed).
    pub fn randn(shape: impl Into<Shape>, rng: &mut impl Rng) -> Self {
        let shape = shape.into();
        let n = shape.elem_count();
        let mut data = Vec::with_capacity(n);
        while data.len() < n {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen_range(0.0..1.0);
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            data.push(r * theta.cos());
            if data.len() < n {
                data.push(r * theta.sin());
            }
        }
        Tensor {
            shape,
            storage: Storage::F32(data),
        }
    }

    /// A scalar F32 tensor.
    pub fn scalar(value: f32) -> Self {
        Tensor {
            shape: Shape::scalar(),
            storage: Storage::F32(vec![value]),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn dtype(&self) -> DType {
        match self.storage {
            Storage::F32(_) => DType::F32,
            Storage::I8(_) => DType::I8,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Borrow the F32 data; fails on I8 tensors.
    pub fn f32_data(&self) -> Result<&[f32]> {
        match &self.storage {
            Storage::F32(v) => Ok(v),
            Storage::I8(_) => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: DType::I8,
            }),
        }
    }

    /// Borrow the I8 data; fails on F32 tensors.
    pub fn i8_data(&self) -> Result<&[i8]> {
        match &self.storage {
            Storage::I8(v) => Ok(v),
            Storage::F32(_) => Err(Error::DTypeMismatch {
                expected: DType::I8,
                got: DType::F32,
            }),
        }
    }

    /// Extract all elements as f32 (I8 values are widened).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.storage {
            Storage::F32(v) => v.clone(),
            Storage::I8(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Summary statistics used by comparison diagnostics.
    pub fn stats(&self) -> TensorStats {
        let data = self.to_f32_vec();
        TensorStats::of(&data)
    }
}

/// Median / mean / max / min of a tensor, for mismatch diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorStats {
    pub median: f32,
    pub mean: f32,
    pub max: f32,
    pub min: f32,
}

impl TensorStats {
    pub fn of(data: &[f32]) -> Self {
        if data.is_empty() {
            return TensorStats {
                median: f32::NAN,
                mean: f32::NAN,
                max: f32::NAN,
                min: f32::NAN,
            };
        }
        let mut sorted = data.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = sorted[sorted.len() / 2];
        let mean = data.iter().sum::<f32>() / data.len() as f32;
        let max = data.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let min = data.iter().fold(f32::INFINITY, |m, &v| m.min(v));
        TensorStats {
            median,
            mean,
            max,
            min,
        }
    }
}

impl std::fmt::Display for TensorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "median: {}, mean: {}, max: {}, min: {}",
            self.median, self.mean, self.max, self.min
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_from_f32_checks_len() {
        assert!(Tensor::from_f32(vec![1.0, 2.0], [2]).is_ok());
        assert!(Tensor::from_f32(vec![1.0, 2.0], [3]).is_err());
    }

    #[test]
    fn test_dtype_tags() {
        let f = Tensor::from_f32(vec![1.0], [1]).unwrap();
        let q = Tensor::from_i8(vec![1], [1]).unwrap();
        assert_eq!(f.dtype(), DType::F32);
        assert_eq!(q.dtype(), DType::I8);
        assert!(f.f32_data().is_ok());
        assert!(f.i8_data().is_err());
        assert!(q.i8_data().is_ok());
    }

    #[test]
    fn test_randn_shape_and_determinism() {
        let mut rng1 = StdRng::seed_from_u64(7);
        let mut rng2 = StdRng::seed_from_u64(7);
        let a = Tensor::randn([2, 3], &mut rng1);
        let b = Tensor::randn([2, 3], &mut rng2);
        assert_eq!(a.dims(), &[2, 3]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_stats() {
        let t = Tensor::from_f32(vec![1.0, 2.0, 3.0, 4.0], [4]).unwrap();
        let s = t.stats();
        assert_eq!(s.mean, 2.5);
        assert_eq!(s.max, 4.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.median, 3.0);
    }

    #[test]
    fn test_i8_widening() {
        let q = Tensor::from_i8(vec![-3, 0, 5], [3]).unwrap();
        assert_eq!(q.to_f32_vec(), vec![-3.0, 0.0, 5.0]);
    }
}
