use crate::dtype::Float;
use crate::error::{TensorError, TensorResult};
use crate::shape::Shape;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// N-dimensional tensor.
///
/// Stores data in a flat contiguous `Vec<T>` with row-major (C-order) layout.
/// Feature maps are rank 4: `(batch, channels, height, width)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Float")]
pub struct Tensor<T: Float> {
    data: Vec<T>,
    shape: Shape,
}

// ─── Construction ───────────────────────────────────────────────────────────

impl<T: Float> Tensor<T> {
    /// Create a tensor from raw data and shape.
    pub fn new(data: Vec<T>, shape: Vec<usize>) -> TensorResult<Self> {
        let s = Shape::new(shape);
        if data.len() != s.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: s.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Tensor { data, shape: s })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, T::ZERO)
    }

    pub fn ones(shape: Vec<usize>) -> Self {
        Self::full(shape, T::ONE)
    }

    pub fn full(shape: Vec<usize>, value: T) -> Self {
        let s = Shape::new(shape);
        Tensor {
            data: vec![value; s.numel()],
            shape: s,
        }
    }

    /// 1-D tensor copied from a slice.
    pub fn from_slice(data: &[T]) -> Self {
        Tensor {
            data: data.to_vec(),
            shape: Shape::new(vec![data.len()]),
        }
    }

    /// Random tensor with uniform distribution in [0, 1).
    pub fn rand(shape: Vec<usize>, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self::uniform(shape, T::ZERO, T::ONE, &mut rng)
    }

    /// Random tensor with standard normal distribution (Box-Muller).
    pub fn randn(shape: Vec<usize>, seed: Option<u64>) -> Self {
        let s = Shape::new(shape);
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let n = s.numel();
        let mut data = Vec::with_capacity(n + 1);
        while data.len() < n {
            let u1: f64 = rng.gen::<f64>().max(1e-10);
            let u2: f64 = rng.gen::<f64>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f64::consts::PI * u2;
            data.push(T::from_f64(r * theta.cos()));
            data.push(T::from_f64(r * theta.sin()));
        }
        data.truncate(n);
        Tensor { data, shape: s }
    }

    /// Draw every element from `U(low, high)` using the caller's generator.
    ///
    /// Layers take the generator by reference so a whole network can be
    /// initialised reproducibly from one seed.
    pub fn uniform<R: Rng + ?Sized>(shape: Vec<usize>, low: T, high: T, rng: &mut R) -> Self {
        let s = Shape::new(shape);
        let (lo, hi) = (low.to_f64(), high.to_f64());
        if !(lo < hi) {
            return Tensor {
                data: vec![low; s.numel()],
                shape: s,
            };
        }
        let dist = Uniform::new(lo, hi);
        let data = (0..s.numel()).map(|_| T::from_f64(dist.sample(rng))).collect();
        Tensor { data, shape: s }
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn shape_vec(&self) -> Vec<usize> {
        self.shape.to_vec()
    }

    /// `[batch, channels, height, width]` of a rank-4 tensor.
    pub fn nchw(&self) -> TensorResult<[usize; 4]> {
        self.shape.nchw()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    fn offset(&self, indices: &[usize]) -> TensorResult<usize> {
        if indices.len() != self.ndim() {
            return Err(TensorError::DimensionMismatch(format!(
                "Expected {} indices, got {}",
                self.ndim(),
                indices.len()
            )));
        }
        let strides = self.shape.strides();
        let mut offset = 0;
        for (axis, (&idx, &size)) in indices.iter().zip(self.shape.dims()).enumerate() {
            if idx >= size {
                return Err(TensorError::IndexOutOfBounds {
                    index: idx,
                    axis,
                    size,
                });
            }
            offset += idx * strides[axis];
        }
        Ok(offset)
    }

    /// Multi-dimensional read.
    pub fn get(&self, indices: &[usize]) -> TensorResult<T> {
        let offset = self.offset(indices)?;
        Ok(self.data[offset])
    }

    /// Multi-dimensional write.
    pub fn set(&mut self, indices: &[usize], value: T) -> TensorResult<()> {
        let offset = self.offset(indices)?;
        self.data[offset] = value;
        Ok(())
    }

    // ─── Shape Manipulation ─────────────────────────────────────────────────

    /// Concatenate tensors along `axis`. All other dimensions must agree.
    pub fn concatenate(tensors: &[&Tensor<T>], axis: usize) -> TensorResult<Tensor<T>> {
        let first = tensors.first().ok_or(TensorError::EmptyTensor)?;
        let ndim = first.ndim();
        if axis >= ndim {
            return Err(TensorError::InvalidAxis { axis, ndim });
        }

        let ref_shape = first.shape_vec();
        for t in &tensors[1..] {
            if t.ndim() != ndim {
                return Err(TensorError::DimensionMismatch(
                    "All tensors must have the same number of dimensions".to_string(),
                ));
            }
            let agrees = ref_shape
                .iter()
                .zip(t.shape.dims())
                .enumerate()
                .all(|(i, (&a, &b))| i == axis || a == b);
            if !agrees {
                return Err(TensorError::ShapeMismatch {
                    expected: ref_shape.clone(),
                    got: t.shape_vec(),
                });
            }
        }

        let outer: usize = ref_shape[..axis].iter().product();
        let inner: usize = ref_shape[axis + 1..].iter().product();
        let new_axis_size: usize = tensors.iter().map(|t| t.shape.dims()[axis]).sum();

        let mut data = Vec::with_capacity(outer * new_axis_size * inner);
        for o in 0..outer {
            for t in tensors {
                let block = t.shape.dims()[axis] * inner;
                let start = o * block;
                data.extend_from_slice(&t.data[start..start + block]);
            }
        }

        let mut new_shape = ref_shape;
        new_shape[axis] = new_axis_size;
        Tensor::new(data, new_shape)
    }

    // ─── Element-wise Operations ────────────────────────────────────────────

    pub fn apply<F: Fn(T) -> T>(&self, f: F) -> Tensor<T> {
        Tensor {
            data: self.data.iter().map(|&x| f(x)).collect(),
            shape: self.shape.clone(),
        }
    }

    pub fn relu(&self) -> Tensor<T> {
        self.apply(|x| if x < T::ZERO { T::ZERO } else { x })
    }

    // ─── Reductions ─────────────────────────────────────────────────────────

    pub fn sum_all(&self) -> T {
        self.data.iter().copied().sum()
    }

    pub fn mean_all(&self) -> T {
        if self.data.is_empty() {
            return T::ZERO;
        }
        self.sum_all() / T::from_usize(self.data.len())
    }

    pub fn max_all(&self) -> TensorResult<T> {
        if self.data.is_empty() {
            return Err(TensorError::EmptyTensor);
        }
        Ok(self.data.iter().copied().fold(T::NEG_INFINITY, T::max))
    }

    pub fn min_all(&self) -> TensorResult<T> {
        if self.data.is_empty() {
            return Err(TensorError::EmptyTensor);
        }
        Ok(self.data.iter().copied().fold(T::INFINITY, T::min))
    }

    /// Largest element-wise absolute difference between two same-shaped tensors.
    pub fn max_abs_diff(&self, other: &Tensor<T>) -> TensorResult<T> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape_vec(),
                got: other.shape_vec(),
            });
        }
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| (a - b).abs())
            .fold(T::ZERO, T::max))
    }

    pub fn has_nan(&self) -> bool {
        self.data.iter().any(|x| x.is_nan())
    }
}

impl<T: Float> PartialEq for Tensor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}
