use oxidize_seg_core::{Tensor, TensorResult};
use rayon::prelude::*;

use crate::module::Module;

/// ReLU activation layer: `max(x, 0)`. NaN passes through.
///
/// When handed an owned tensor (inside a [`Sequential`](crate::Sequential))
/// it rewrites the buffer in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl ReLU {
    pub fn new() -> Self {
        ReLU
    }
}

impl Module for ReLU {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        Ok(input.relu())
    }

    fn forward_owned(&self, mut input: Tensor<f32>) -> TensorResult<Tensor<f32>> {
        input.data_mut().par_iter_mut().for_each(|x| {
            if *x < 0.0 {
                *x = 0.0;
            }
        });
        Ok(input)
    }
}
